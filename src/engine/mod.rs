//! The multiplexing request engine. Reference: spec section 4.C.
//!
//! Re-architected per spec section 9's redesign flag ("callback-style I/O
//! wrapped into promises" -> "a mailbox-serialized transport"): a single
//! background thread owns the `Transport` and all engine state, directly
//! generalizing the teacher's `update.rs` pattern of a worker thread
//! reporting over `mpsc::Sender<Message>` into a request/response mailbox.
//! Running everything on one thread gives single-flight, ordering-within-a-
//! request, and mutex-free state for free; only the one thread ever touches
//! `Transport` or the record map.

mod policy;
mod record;

pub use policy::PollingPolicy;
pub use record::{ControlReply, Payload, ReplyData};

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use record::Record;

use crate::codec::{
    build_check_setup, build_init_setup, build_recv_setup, build_reset_setup, build_send_setup,
    check_u16_range, ServiceReply, ServiceStatus,
};
use crate::transport::{Setup, Transport, DEFAULT_TIMEOUT};
use crate::Error;

/// Default per-request timeout (spec section 6: "Request options and
/// defaults").
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sideband request used to fetch a firmware version string outside the
/// vendor service protocol (spec section 6: `bRequest=0x50 ("P")`).
const FIRMWARE_VERSION_REQUEST: u8 = 0x50;
const FIRMWARE_VERSION_INDEX: u16 = 30;
const FIRMWARE_VERSION_MIN_LENGTH: u16 = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// `auto` (unbounded until the device signals BUSY) when `None` (spec
    /// section 4.C).
    pub concurrent_requests: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CloseOptions {
    pub process_pending_requests: bool,
    pub timeout: Option<Duration>,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            process_pending_requests: true,
            timeout: None,
        }
    }
}

#[derive(Clone)]
pub struct SendOptions {
    pub polling_policy: PollingPolicy,
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            polling_policy: PollingPolicy::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Identity read during `open` (spec section 4.C: "read serial number
/// descriptor... attempt to read firmware version").
#[derive(Debug, Clone)]
pub struct Identity {
    pub serial_number: String,
    pub firmware_version: Option<String>,
}

enum Command {
    Send {
        request_type: u16,
        payload: Payload,
        options: SendOptions,
        reply_tx: Sender<Result<ControlReply, Error>>,
    },
    Close {
        options: CloseOptions,
    },
}

/// Handle to the running worker thread. Dropping it without calling
/// [`Engine::close`] forces an immediate, non-draining close.
///
/// `cmd_tx` is wrapped in a `Mutex` (rather than left a bare `Sender`) so
/// `&Engine` is `Sync`: callers may issue several `send_control_request`
/// calls concurrently from different threads, each blocking only on its own
/// reply channel once the command is enqueued.
pub struct Engine {
    cmd_tx: Mutex<Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Opens the transport, identifies the device, and starts the worker
    /// thread. The worker schedules a one-shot reset-all as its first piece
    /// of work (spec section 4.C: "schedule a one-shot reset-all to purge
    /// stale device-side state").
    pub fn open(mut transport: Box<dyn Transport>, options: EngineOptions) -> Result<(Self, Identity), Error> {
        transport.open()?;
        let raw_serial = transport.serial_number()?;
        let serial_number = normalize_serial(&raw_serial);
        let firmware_version = read_firmware_version(transport.as_ref()).ok();

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("particle-usb-host-engine".into())
            .spawn(move || run(transport, options, cmd_rx))
            .map_err(|_| Error::Internal("failed to spawn engine worker thread"))?;

        Ok((
            Self {
                cmd_tx: Mutex::new(cmd_tx),
                worker: Mutex::new(Some(worker)),
            },
            Identity {
                serial_number,
                firmware_version,
            },
        ))
    }

    /// Enqueues a request and blocks until the device resolves or rejects
    /// it (spec section 4.C).
    pub fn send_control_request(
        &self,
        request_type: i64,
        data: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<ControlReply, Error> {
        let request_type_u32 = u32::try_from(request_type)
            .map_err(|_| Error::Range(format!("request type {request_type} out of range")))?;
        let request_type = check_u16_range(request_type_u32, "request type")?;

        let payload: Payload = data.into();
        if payload.len() > 0xFFFF {
            return Err(Error::Range(format!(
                "payload size {} exceeds the 0xFFFF limit",
                payload.len()
            )));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .lock()
            .unwrap()
            .send(Command::Send {
                request_type,
                payload,
                options,
                reply_tx,
            })
            .map_err(|_| closed_error())?;

        reply_rx.recv().map_err(|_| closed_error())?
    }

    /// Transitions Open -> Closing -> Closed. Blocks until the worker
    /// thread has finished (which, with `processPendingRequests: true` and
    /// no timeout, may be an indefinite wait -- spec section 9's first
    /// ambiguity is resolved to waiting indefinitely).
    ///
    /// Takes `&self` (the join handle lives behind a `Mutex`, like `cmd_tx`)
    /// so a caller can close an `Engine` shared with other threads still
    /// blocked in `send_control_request`; those calls unblock with a
    /// [`Error::State`] once the worker drains its command channel.
    pub fn close(&self, options: CloseOptions) -> Result<(), Error> {
        let _ = self.cmd_tx.lock().unwrap().send(Command::Close { options });
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| Error::Internal("engine worker thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.worker.get_mut().unwrap().is_some() {
            let _ = self.close(CloseOptions {
                process_pending_requests: false,
                timeout: None,
            });
        }
    }
}

fn closed_error() -> Error {
    Error::State {
        state: "closed",
        detail: "engine worker is no longer running",
    }
}

pub(crate) fn normalize_serial(raw: &str) -> String {
    raw.chars()
        .filter(|c| (' '..='~').contains(c))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn read_firmware_version(transport: &dyn Transport) -> Result<String, Error> {
    let setup = Setup::new(
        0xC0,
        FIRMWARE_VERSION_REQUEST,
        0,
        FIRMWARE_VERSION_INDEX,
        FIRMWARE_VERSION_MIN_LENGTH,
    );
    let bytes = transport.control_in(setup, DEFAULT_TIMEOUT)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| Error::Protocol("firmware version reply is not valid UTF-8".into()))
}

/// All engine state, owned exclusively by the worker thread.
struct State {
    transport: Box<dyn Transport>,
    cmd_rx: Receiver<Command>,
    records: HashMap<u64, Record>,
    ready: VecDeque<u64>,
    check: VecDeque<u64>,
    reset: VecDeque<u64>,
    active_count: usize,
    max_active: Option<usize>,
    last_id: u64,
    busy: bool,
    want_close: bool,
    close_deadline: Option<Instant>,
    reset_all_on_open: bool,
    closed: bool,
}

fn run(transport: Box<dyn Transport>, options: EngineOptions, cmd_rx: Receiver<Command>) {
    let mut state = State {
        transport,
        cmd_rx,
        records: HashMap::new(),
        ready: VecDeque::new(),
        check: VecDeque::new(),
        reset: VecDeque::new(),
        active_count: 0,
        max_active: options.concurrent_requests,
        last_id: 0,
        busy: false,
        want_close: false,
        close_deadline: None,
        reset_all_on_open: true,
        closed: false,
    };

    loop {
        if !state.has_immediate_work() {
            match state.next_wakeup() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        match state.cmd_rx.recv_timeout(deadline - now) {
                            Ok(cmd) => state.handle_command(cmd),
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => state.force_close(),
                        }
                    }
                }
                None => match state.cmd_rx.recv() {
                    Ok(cmd) => state.handle_command(cmd),
                    Err(_) => state.force_close(),
                },
            }
        }

        state.fire_expired_timers();
        state.process();

        if state.closed {
            break;
        }
    }
}

impl State {
    fn has_immediate_work(&self) -> bool {
        self.reset_all_on_open
            || !self.reset.is_empty()
            || !self.check.is_empty()
            || (!self.ready.is_empty() && self.active_count < self.max_active.unwrap_or(usize::MAX))
            || (self.want_close && self.active_count == 0 && !self.closed)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let mut min: Option<Instant> = None;
        let mut consider = |d: Instant, min: &mut Option<Instant>| {
            *min = Some(min.map_or(d, |m| m.min(d)));
        };
        for record in self.records.values() {
            if let Some(d) = record.check_due {
                consider(d, &mut min);
            }
            if let Some(d) = record.timeout_deadline {
                consider(d, &mut min);
            }
        }
        if let Some(d) = self.close_deadline {
            consider(d, &mut min);
        }
        min
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                request_type,
                payload,
                options,
                reply_tx,
            } => {
                if self.want_close {
                    let _ = reply_tx.send(Err(Error::State {
                        state: "closing",
                        detail: "engine is closing and no longer accepts new requests",
                    }));
                    return;
                }
                self.last_id = self.last_id.wrapping_add(1);
                let id = self.last_id;
                let timeout_deadline = Some(Instant::now() + options.timeout);
                let mut record = Record::new(
                    id,
                    request_type,
                    payload,
                    options.polling_policy,
                    timeout_deadline,
                    reply_tx,
                );
                record.timeout_value = Some(options.timeout);
                self.records.insert(id, record);
                self.ready.push_back(id);
            }
            Command::Close { options } => self.begin_close(options),
        }
    }

    fn begin_close(&mut self, options: CloseOptions) {
        self.want_close = true;
        if !options.process_pending_requests {
            let ids: Vec<u64> = self.records.keys().copied().collect();
            for id in ids {
                self.resolve_or_reject(
                    id,
                    Err(Error::State {
                        state: "closing",
                        detail: "close() rejected pending requests (processPendingRequests=false)",
                    }),
                );
            }
        } else if let Some(timeout) = options.timeout {
            self.close_deadline = Some(Instant::now() + timeout);
        }
        // else: wait indefinitely for pending requests (spec section 9,
        // first ambiguity).
    }

    fn force_close(&mut self) {
        self.begin_close(CloseOptions {
            process_pending_requests: false,
            timeout: None,
        });
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();

        let due_checks: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| r.check_due.map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due_checks {
            if let Some(rec) = self.records.get_mut(&id) {
                rec.check_due = None;
            }
            self.check.push_back(id);
        }

        let timed_out: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| !r.done && r.timeout_deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            self.timeout_reject(id);
        }

        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                let ids: Vec<u64> = self.records.keys().copied().collect();
                for id in ids {
                    let timeout_value = self
                        .records
                        .get(&id)
                        .and_then(|r| r.timeout_value)
                        .unwrap_or_default();
                    self.resolve_or_reject(id, Err(Error::Timeout(timeout_value)));
                }
                self.close_deadline = None;
            }
        }
    }

    /// Runs the scheduler's strict priority order until no further
    /// immediate work is available (spec section 4.C "process()").
    fn process(&mut self) {
        while self.step() {}
    }

    fn step(&mut self) -> bool {
        if self.reset_all_on_open {
            self.do_reset_all();
            self.reset_all_on_open = false;
            self.active_count = 0;
            return true;
        }

        if let Some(id) = self.reset.pop_front() {
            self.do_reset_one(id);
            return true;
        }

        if let Some(id) = self.check.pop_front() {
            if self.records.get(&id).map_or(true, |r| r.done) {
                return true;
            }
            self.do_check(id);
            return true;
        }

        if self.active_count < self.max_active.unwrap_or(usize::MAX) {
            if let Some(id) = self.ready.pop_front() {
                if self.records.get(&id).map_or(true, |r| r.done) {
                    return true;
                }
                self.do_init(id);
                return true;
            }
        }

        if self.want_close && self.active_count == 0 {
            self.finish_close();
            return false;
        }

        false
    }

    fn finish_close(&mut self) {
        if let Err(err) = self.transport.close() {
            log::warn!("error closing transport: {err}");
        }
        self.closed = true;
    }

    /// Drains any commands that arrived while a blocking USB call was in
    /// flight and checks for expired timers. Called at every suspension
    /// point (spec section 5) so cancellation/timeout is observed between
    /// chunks, not just between scheduler ticks.
    fn tick_suspension_point(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.handle_command(cmd);
        }
        self.fire_expired_timers();
    }

    fn call_control_in(&mut self, setup: Setup) -> Result<Vec<u8>, Error> {
        debug_assert!(!self.busy, "single-flight invariant violated");
        self.busy = true;
        let result = self.transport.control_in(setup, DEFAULT_TIMEOUT);
        self.busy = false;
        self.tick_suspension_point();
        result
    }

    fn call_control_out(&mut self, setup: Setup, data: &[u8]) -> Result<usize, Error> {
        debug_assert!(!self.busy, "single-flight invariant violated");
        self.busy = true;
        let result = self.transport.control_out(setup, data, DEFAULT_TIMEOUT);
        self.busy = false;
        self.tick_suspension_point();
        result
    }

    fn do_reset_all(&mut self) {
        let setup = build_reset_setup(0);
        if let Err(err) = self.call_control_in(setup) {
            log::warn!("reset-all on open failed: {err}");
        }
    }

    fn do_reset_one(&mut self, id: u64) {
        let protocol_id = match self.records.get(&id) {
            Some(rec) => rec.protocol_id,
            None => return,
        };
        let setup = build_reset_setup(protocol_id);
        if let Err(err) = self.call_control_in(setup) {
            log::warn!("per-request RESET for protocol id {protocol_id} failed: {err}");
        }
        self.records.remove(&id);
        if self.active_count > 0 {
            self.active_count -= 1;
        }
    }

    fn do_init(&mut self, id: u64) {
        let (request_type, payload_len) = {
            let rec = self.records.get(&id).unwrap();
            (rec.request_type, rec.payload.len() as u16)
        };
        let setup = build_init_setup(request_type, payload_len);
        match self.call_control_in(setup) {
            Err(err) => self.resolve_or_reject(id, Err(err)),
            Ok(bytes) => match ServiceReply::decode(&bytes) {
                Err(err) => self.resolve_or_reject(id, Err(err)),
                Ok(reply) => self.handle_init_reply(id, reply),
            },
        }
    }

    fn handle_init_reply(&mut self, id: u64, reply: ServiceReply) {
        match reply.status {
            ServiceStatus::Ok => {
                let protocol_id = reply.id.unwrap_or(0);
                let has_payload = {
                    let rec = self.records.get_mut(&id).unwrap();
                    rec.protocol_id = protocol_id;
                    rec.payload.len() > 0
                };
                self.active_count += 1;

                if has_payload {
                    if let Err(err) = self.send_chunks(id) {
                        self.resolve_or_reject(id, Err(err));
                        return;
                    }
                }
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.data_sent = true;
                    rec.check_attempt = 0;
                    let now = Instant::now();
                    rec.schedule_check(now);
                }
            }
            ServiceStatus::Pending => {
                let protocol_id = reply.id.unwrap_or(0);
                self.active_count += 1;
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.protocol_id = protocol_id;
                    let now = Instant::now();
                    rec.schedule_check(now);
                }
            }
            ServiceStatus::Busy => {
                self.max_active = Some(self.active_count);
                self.ready.push_front(id);
            }
            ServiceStatus::NoMemory => self.resolve_or_reject(id, Err(Error::Memory)),
            other => self.resolve_or_reject(
                id,
                Err(Error::Protocol(format!("unexpected status {other:?} after INIT"))),
            ),
        }
    }

    fn do_check(&mut self, id: u64) {
        let protocol_id = self.records.get(&id).unwrap().protocol_id;
        let setup = build_check_setup(protocol_id);
        match self.call_control_in(setup) {
            Err(err) => self.resolve_or_reject(id, Err(err)),
            Ok(bytes) => match ServiceReply::decode(&bytes) {
                Err(err) => self.resolve_or_reject(id, Err(err)),
                Ok(reply) => self.handle_check_reply(id, reply),
            },
        }
    }

    fn handle_check_reply(&mut self, id: u64, reply: ServiceReply) {
        let data_sent = self.records.get(&id).unwrap().data_sent;

        match (data_sent, reply.status) {
            (false, ServiceStatus::Ok) => {
                if let Err(err) = self.send_chunks(id) {
                    self.resolve_or_reject(id, Err(err));
                    return;
                }
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.data_sent = true;
                    rec.check_attempt = 0;
                    let now = Instant::now();
                    rec.schedule_check(now);
                }
            }
            (true, ServiceStatus::Ok) => {
                let size = reply.size.unwrap_or(0);
                let result = reply.result.unwrap_or(0);
                if size == 0 {
                    self.resolve_or_reject(id, Ok(ControlReply { result, data: None }));
                    return;
                }
                match self.recv_chunks(id, size) {
                    Err(err) => self.resolve_or_reject(id, Err(err)),
                    Ok(data) => {
                        let is_text = self.records.get(&id).unwrap().payload.is_text();
                        let reply_data = if is_text {
                            match String::from_utf8(data) {
                                Ok(s) => ReplyData::Text(s),
                                Err(_) => {
                                    self.resolve_or_reject(
                                        id,
                                        Err(Error::Protocol("reply bytes are not valid UTF-8".into())),
                                    );
                                    return;
                                }
                            }
                        } else {
                            ReplyData::Bytes(data)
                        };
                        self.resolve_or_reject(
                            id,
                            Ok(ControlReply {
                                result,
                                data: Some(reply_data),
                            }),
                        );
                    }
                }
            }
            (_, ServiceStatus::Pending) => {
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.check_attempt += 1;
                    let now = Instant::now();
                    rec.schedule_check(now);
                }
            }
            (_, ServiceStatus::NoMemory) => self.resolve_or_reject(id, Err(Error::Memory)),
            (_, ServiceStatus::NotFound) => {
                self.resolve_or_reject(id, Err(Error::NotFound("request cancelled by device".into())))
            }
            (_, other) => self.resolve_or_reject(
                id,
                Err(Error::Protocol(format!("unexpected status {other:?} after CHECK"))),
            ),
        }
    }

    fn send_chunks(&mut self, id: u64) -> Result<(), Error> {
        let (protocol_id, data) = {
            let rec = self.records.get(&id).unwrap();
            (rec.protocol_id, rec.payload.as_bytes().to_vec())
        };
        let mtu = self.transport.max_control_transfer_data_size().max(1);

        for chunk in data.chunks(mtu) {
            if self.records.get(&id).map_or(true, |r| r.done) {
                return Err(Error::Cancelled);
            }
            let setup = build_send_setup(protocol_id, chunk.len() as u16);
            self.call_control_out(setup, chunk)?;
            if self.records.get(&id).map_or(true, |r| r.done) {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    fn recv_chunks(&mut self, id: u64, total_size: u32) -> Result<Vec<u8>, Error> {
        let protocol_id = self.records.get(&id).unwrap().protocol_id;
        let mtu = self.transport.max_control_transfer_data_size() as u32;
        let mut data = Vec::with_capacity(total_size as usize);
        let mut remaining = total_size;

        while remaining > 0 {
            if self.records.get(&id).map_or(true, |r| r.done) {
                return Err(Error::Cancelled);
            }
            let want = remaining.min(mtu.max(1));
            let setup = build_recv_setup(protocol_id, want as u16);
            let chunk = self.call_control_in(setup)?;
            if chunk.len() as u32 != want {
                return Err(Error::Protocol(format!(
                    "RECV returned {} bytes, expected exactly {want}",
                    chunk.len()
                )));
            }
            data.extend_from_slice(&chunk);
            remaining -= want;
            if self.records.get(&id).map_or(true, |r| r.done) {
                return Err(Error::Cancelled);
            }
        }
        Ok(data)
    }

    /// Normal (non-timeout) completion: decrements `activeCount`
    /// immediately and drops the record (spec section 7: SEND/RECV failures
    /// "fail that request but leave the engine live", no per-request RESET).
    fn resolve_or_reject(&mut self, id: u64, result: Result<ControlReply, Error>) {
        if let Some(rec) = self.records.get_mut(&id) {
            let had_protocol = rec.protocol_id != 0;
            rec.check_due = None;
            rec.timeout_deadline = None;
            rec.complete(result);
            if had_protocol && self.active_count > 0 {
                self.active_count -= 1;
            }
        }
        self.records.remove(&id);
    }

    /// Timeout completion: rejects with `TimeoutError`, but defers
    /// `activeCount--` until the device has actually been told via a
    /// per-request RESET (spec section 4.C: "if it had a protocol id, it is
    /// additionally enqueued on the reset queue").
    fn timeout_reject(&mut self, id: u64) {
        let (had_protocol, timeout_value) = match self.records.get_mut(&id) {
            Some(rec) => {
                let had_protocol = rec.protocol_id != 0;
                let timeout_value = rec.timeout_value.unwrap_or_default();
                rec.check_due = None;
                rec.timeout_deadline = None;
                rec.complete(Err(Error::Timeout(timeout_value)));
                (had_protocol, timeout_value)
            }
            None => return,
        };
        let _ = timeout_value;
        if had_protocol {
            self.reset.push_back(id);
        } else {
            self.records.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockScript, MockTransport};

    fn open_engine(script: MockScript) -> (Engine, Identity) {
        let transport = MockTransport::new(script);
        Engine::open(Box::new(transport), EngineOptions::default()).expect("engine opens")
    }

    #[test]
    fn s1_resolves_with_no_send_or_recv() {
        let script = MockScript::new();
        let (engine, _id) = open_engine(script);
        let reply = engine
            .send_control_request(1, Vec::<u8>::new(), SendOptions::default())
            .unwrap();
        assert_eq!(reply.result, 0);
        assert!(reply.data.is_none());
    }

    #[test]
    fn s2_echoes_string_payload() {
        let script = MockScript::echo();
        let (engine, _id) = open_engine(script);
        let reply = engine
            .send_control_request(1, "request data", SendOptions::default())
            .unwrap();
        match reply.data {
            Some(ReplyData::Text(s)) => assert_eq!(s, "request data"),
            other => panic!("expected text reply, got {other:?}"),
        }
    }

    #[test]
    fn s9_rejects_out_of_range_request_type() {
        let script = MockScript::new();
        let (engine, _id) = open_engine(script);
        let err = engine
            .send_control_request(-1, Vec::<u8>::new(), SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Range(_)));

        let err = engine
            .send_control_request(65536, Vec::<u8>::new(), SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Range(_)));
    }
}
