//! In-memory [`Transport`] fake.
//!
//! Used by this crate's own `#[cfg(test)]` modules and by the black-box
//! tests under `tests/`, mirroring how `dfu-core`'s test suite drives its
//! driver against a fake USB backend instead of real hardware. Not part of
//! the device-facing API; nothing in `device`/`engine`/`dfu` depends on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::ServiceReply;
use crate::codec::ServiceStatus;
use crate::dfu::dfuse;
use crate::dfu::states::{DeviceStateCode, DeviceStatusCode};
use crate::transport::{InterfaceDescriptor, Setup, Transport};
use crate::Error;

const FIRMWARE_REQUEST: u8 = 0x50;
const INIT_REQUEST: u8 = 1;
const CHECK_REQUEST: u8 = 2;
const SEND_REQUEST: u8 = 3;
const RECV_REQUEST: u8 = 4;
const RESET_REQUEST: u8 = 5;

/// What the simulated device decides once it has the full request payload.
pub enum MockOutcome {
    Ok { result: i32, reply: Option<Vec<u8>> },
    /// CHECK returns `PENDING` forever; used to exercise per-request timeout
    /// (spec section 8, scenario S4).
    Pending,
    NoMemory,
    NotFound,
}

type Responder = Box<dyn Fn(u16, &[u8]) -> MockOutcome + Send>;

/// Describes how the simulated device answers every request it receives.
pub struct MockScript {
    responder: Responder,
    max_concurrent: Option<usize>,
}

impl MockScript {
    /// Every request resolves with `result: 0` and the given reply bytes
    /// (or no reply data at all).
    pub fn always_ok(reply: Option<Vec<u8>>) -> Self {
        Self {
            responder: Box::new(move |_request_type, _payload| MockOutcome::Ok {
                result: 0,
                reply: reply.clone(),
            }),
            max_concurrent: None,
        }
    }

    /// Every request resolves with `result: 0` and no reply payload.
    pub fn new() -> Self {
        Self::always_ok(None)
    }

    /// Every request resolves by echoing its own payload back as the reply.
    pub fn echo() -> Self {
        Self {
            responder: Box::new(|_request_type, payload| MockOutcome::Ok {
                result: 0,
                reply: Some(payload.to_vec()),
            }),
            max_concurrent: None,
        }
    }

    /// CHECK always answers `PENDING`, simulating a device that never
    /// finishes a request (spec section 8, scenario S4).
    pub fn pending_forever() -> Self {
        Self {
            responder: Box::new(|_request_type, _payload| MockOutcome::Pending),
            max_concurrent: None,
        }
    }

    /// Fully custom outcome as a function of request type and payload.
    pub fn respond_with<F>(f: F) -> Self
    where
        F: Fn(u16, &[u8]) -> MockOutcome + Send + 'static,
    {
        Self {
            responder: Box::new(f),
            max_concurrent: None,
        }
    }

    /// Caps how many sessions the simulated device keeps open at once; INIT
    /// answers `BUSY` beyond the cap (spec section 8, scenario S5). A
    /// session frees its slot once its reply has been fully delivered (or it
    /// ends in `NoMemory`/`NotFound`), mirroring the device freeing its
    /// internal buffer.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

struct Session {
    request_type: u16,
    expected_len: usize,
    sent: Vec<u8>,
    reply: Vec<u8>,
    reply_sent: usize,
}

struct MockState {
    next_id: u16,
    sessions: HashMap<u16, Session>,
}

pub struct MockTransport {
    script: Responder,
    max_concurrent: Option<usize>,
    state: Mutex<MockState>,
    /// Length of every `SEND` data stage observed, in call order. Exists so
    /// tests can assert chunking behavior (spec section 8, scenario S3).
    send_log: Mutex<Vec<usize>>,
    /// Count of `BUSY` replies INIT has handed out so far. Exists so tests
    /// can assert the backpressure path actually fired instead of inferring
    /// it from timing (spec section 8, scenario S5).
    busy_count: Arc<AtomicUsize>,
    mtu: usize,
    vendor_id: u16,
    product_id: u16,
    serial_number: String,
    firmware_version: Option<&'static str>,
}

impl MockTransport {
    pub fn new(script: MockScript) -> Self {
        Self {
            script: script.responder,
            max_concurrent: script.max_concurrent,
            state: Mutex::new(MockState {
                next_id: 1,
                sessions: HashMap::new(),
            }),
            send_log: Mutex::new(Vec::new()),
            busy_count: Arc::new(AtomicUsize::new(0)),
            mtu: 4096,
            vendor_id: 0x2B04,
            product_id: 0xD00D,
            serial_number: "mock-serial-0001".to_string(),
            firmware_version: Some("1.2.3-mock"),
        }
    }

    /// Lengths of every `SEND` data stage observed so far, in call order.
    pub fn send_chunk_lengths(&self) -> Vec<usize> {
        self.send_log.lock().unwrap().clone()
    }

    /// A handle tracking how many `BUSY` replies INIT has returned, clonable
    /// before the transport is boxed and handed to an `Engine`/`Device`.
    pub fn busy_counter(&self) -> Arc<AtomicUsize> {
        self.busy_count.clone()
    }

    /// Suppresses the firmware version sideband read, exercising the path
    /// where a device doesn't implement it (spec section 6: best-effort,
    /// `None` on failure).
    pub fn without_firmware_version(mut self) -> Self {
        self.firmware_version = None;
        self
    }

    /// Overrides `max_control_transfer_data_size`, exercising chunking with
    /// a small MTU instead of allocating megabyte-scale test payloads (spec
    /// section 8, scenario S3).
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}

impl Transport for MockTransport {
    fn max_control_transfer_data_size(&self) -> usize {
        self.mtu
    }

    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn control_in(&self, setup: Setup, _timeout: Duration) -> Result<Vec<u8>, Error> {
        match setup.b_request {
            INIT_REQUEST => self.handle_init(setup),
            CHECK_REQUEST => self.handle_check(setup),
            RECV_REQUEST => self.handle_recv(setup),
            RESET_REQUEST => self.handle_reset(setup),
            FIRMWARE_REQUEST => self.handle_firmware(setup),
            other => Err(Error::Protocol(format!("mock transport: unexpected bRequest {other}"))),
        }
    }

    fn control_out(&self, setup: Setup, data: &[u8], _timeout: Duration) -> Result<usize, Error> {
        if setup.b_request != SEND_REQUEST {
            return Err(Error::Protocol(format!(
                "mock transport: unexpected OUT bRequest {}",
                setup.b_request
            )));
        }
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&setup.w_index)
            .ok_or_else(|| Error::Protocol("mock transport: SEND to unknown protocol id".into()))?;
        session.sent.extend_from_slice(data);
        self.send_log.lock().unwrap().push(data.len());
        Ok(data.len())
    }

    fn claim_interface(&mut self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn set_alt_setting(&mut self, _interface: u8, _alt_setting: u8) -> Result<(), Error> {
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn serial_number(&self) -> Result<String, Error> {
        Ok(self.serial_number.clone())
    }

    fn read_string_descriptor(&self, _index: u8) -> Result<String, Error> {
        Ok(String::new())
    }

    fn interface_descriptors(&self) -> Result<Vec<InterfaceDescriptor>, Error> {
        Ok(Vec::new())
    }
}

impl MockTransport {
    fn handle_init(&self, setup: Setup) -> Result<Vec<u8>, Error> {
        let payload_size = setup.w_value as usize;
        let request_type = setup.w_index;

        let mut state = self.state.lock().unwrap();

        if let Some(max) = self.max_concurrent {
            if state.sessions.len() >= max {
                self.busy_count.fetch_add(1, Ordering::SeqCst);
                let reply = ServiceReply {
                    status: ServiceStatus::Busy,
                    id: None,
                    size: None,
                    result: None,
                };
                return Ok(reply.encode());
            }
        }

        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1).max(1);

        let session = Session {
            request_type,
            expected_len: payload_size,
            sent: Vec::with_capacity(payload_size),
            reply: Vec::new(),
            reply_sent: 0,
        };
        state.sessions.insert(id, session);

        let reply = ServiceReply {
            status: ServiceStatus::Ok,
            id: Some(id),
            size: None,
            result: None,
        };
        Ok(reply.encode())
    }

    fn handle_check(&self, setup: Setup) -> Result<Vec<u8>, Error> {
        let protocol_id = setup.w_index;
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&protocol_id)
            .ok_or_else(|| Error::Protocol("mock transport: CHECK on unknown protocol id".into()))?;

        if session.sent.len() < session.expected_len {
            let reply = ServiceReply {
                status: ServiceStatus::Pending,
                id: None,
                size: None,
                result: None,
            };
            return Ok(reply.encode());
        }

        // Recomputed on every poll rather than cached after the first call:
        // a script can legitimately answer `Pending` for a while and then
        // resolve once some external condition (e.g. a test holding a
        // shared flag) changes, mirroring a real device's CHECK semantics
        // (spec section 8, scenario S5).
        let request_type = session.request_type;
        let sent = session.sent.clone();
        let outcome = (self.script)(request_type, &sent);

        let mut finished = false;
        let reply = match &outcome {
            MockOutcome::Ok { result, reply } => {
                session.reply = reply.clone().unwrap_or_default();
                finished = session.reply.is_empty();
                ServiceReply {
                    status: ServiceStatus::Ok,
                    id: None,
                    size: Some(session.reply.len() as u32),
                    result: Some(*result),
                }
            }
            MockOutcome::Pending => ServiceReply {
                status: ServiceStatus::Pending,
                id: None,
                size: None,
                result: None,
            },
            MockOutcome::NoMemory => {
                finished = true;
                ServiceReply {
                    status: ServiceStatus::NoMemory,
                    id: None,
                    size: None,
                    result: None,
                }
            }
            MockOutcome::NotFound => {
                finished = true;
                ServiceReply {
                    status: ServiceStatus::NotFound,
                    id: None,
                    size: None,
                    result: None,
                }
            }
        };
        if finished {
            state.sessions.remove(&protocol_id);
        }
        Ok(reply.encode())
    }

    fn handle_recv(&self, setup: Setup) -> Result<Vec<u8>, Error> {
        let protocol_id = setup.w_index;
        let want = setup.w_length as usize;
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&protocol_id)
            .ok_or_else(|| Error::Protocol("mock transport: RECV on unknown protocol id".into()))?;

        let end = (session.reply_sent + want).min(session.reply.len());
        let chunk = session.reply[session.reply_sent..end].to_vec();
        session.reply_sent = end;
        let finished = session.reply_sent >= session.reply.len();
        if finished {
            state.sessions.remove(&protocol_id);
        }
        Ok(chunk)
    }

    fn handle_reset(&self, setup: Setup) -> Result<Vec<u8>, Error> {
        let protocol_id = setup.w_index;
        let mut state = self.state.lock().unwrap();
        if protocol_id == 0 {
            state.sessions.clear();
        } else {
            state.sessions.remove(&protocol_id);
        }
        let reply = ServiceReply {
            status: ServiceStatus::Ok,
            id: None,
            size: None,
            result: None,
        };
        Ok(reply.encode())
    }

    fn handle_firmware(&self, setup: Setup) -> Result<Vec<u8>, Error> {
        match self.firmware_version {
            None => Err(Error::UsbStall),
            Some(version) => {
                let mut buf = vec![0u8; setup.w_length as usize];
                let bytes = version.as_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(buf)
            }
        }
    }
}

// --- DFU-protocol fake ---
//
// The vendor protocol above and DFU 1.1 reuse the same `bRequest` numbers
// (e.g. vendor INIT=1 collides with DFU_DNLOAD=1) on different
// `bmRequestType` values, so rather than overload one fake with a
// `bm_request_type` dispatch, DFU gets its own `Transport` fake, grounded on
// `dfu-core`'s hand-written `MockIO` (`58479419_dfu-rs-dfu-core__tests-mock.rs.rs`):
// one struct behind a `Mutex`, matching on DFU request/state pairs.

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

const DFUSE_SET_ADDRESS_POINTER: u8 = 0x21;
const DFUSE_ERASE_SECTOR: u8 = 0x41;

const DFU_INTERFACE_STRING_INDEX: u8 = 1;

struct MockDfuState {
    status: DeviceStatusCode,
    device_state: DeviceStateCode,
    current_address: u32,
    /// Addresses passed to `SET_ADDRESS_POINTER`, in call order.
    set_address_log: Vec<u32>,
    /// Addresses passed to `ERASE_SECTOR`, in call order (spec section 8,
    /// scenario S7).
    erase_log: Vec<u32>,
    /// `(address, bytes)` pairs written by a data-stage `DNLOAD`, in call
    /// order (spec section 8, scenario S8).
    download_log: Vec<(u32, Vec<u8>)>,
}

/// Handle to a [`MockDfuTransport`]'s internal state, clonable before the
/// transport is boxed and handed to a `DfuDriver`, so tests can inspect what
/// happened after the driver call returns (mirrors `MockTransport::busy_counter`).
#[derive(Clone)]
pub struct MockDfuStateHandle(Arc<Mutex<MockDfuState>>);

impl MockDfuStateHandle {
    /// The state the last `GET_STATUS` reply reported.
    pub fn device_state(&self) -> DeviceStateCode {
        self.0.lock().unwrap().device_state
    }

    /// Addresses passed to `ERASE_SECTOR`, in call order (spec section 8,
    /// scenario S7).
    pub fn erase_log(&self) -> Vec<u32> {
        self.0.lock().unwrap().erase_log.clone()
    }

    /// Addresses passed to `SET_ADDRESS_POINTER`, in call order.
    pub fn set_address_log(&self) -> Vec<u32> {
        self.0.lock().unwrap().set_address_log.clone()
    }

    /// `(address, bytes)` pairs written by a data-stage `DNLOAD`, in call
    /// order (spec section 8, scenario S8).
    pub fn download_log(&self) -> Vec<(u32, Vec<u8>)> {
        self.0.lock().unwrap().download_log.clone()
    }
}

/// In-memory [`Transport`] fake speaking DFU 1.1 + the DfuSe vendor
/// extension, for exercising [`crate::dfu::DfuDriver`] and
/// [`crate::dfu::memory`] without hardware.
pub struct MockDfuTransport {
    state: Arc<Mutex<MockDfuState>>,
    memory_descriptor: String,
    /// When set, the manifest-triggering zero-length `DNLOAD` is followed by
    /// a `GET_STATUS` reporting `dfuDNLOAD_IDLE` instead of `dfuMANIFEST`
    /// (spec section 9, second Open Question; spec section 8, scenario S6).
    gen2_manifest_quirk: bool,
    vendor_id: u16,
    product_id: u16,
    serial_number: String,
}

impl MockDfuTransport {
    /// `memory_descriptor` is the DfuSe interface string, e.g.
    /// `"@Flash/0x08000000/04*004Kg"`.
    pub fn new(memory_descriptor: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockDfuState {
                status: DeviceStatusCode::OK,
                device_state: DeviceStateCode::dfuIDLE,
                current_address: 0,
                set_address_log: Vec::new(),
                erase_log: Vec::new(),
                download_log: Vec::new(),
            })),
            memory_descriptor: memory_descriptor.into(),
            gen2_manifest_quirk: false,
            vendor_id: 0x2B04,
            product_id: 0xDF11,
            serial_number: "mock-dfu-serial-0001".to_string(),
        }
    }

    /// Accepts the Gen2 manifest quirk: after the manifest-triggering
    /// zero-length `DNLOAD`, `GET_STATUS` reports `dfuDNLOAD_IDLE` instead of
    /// `dfuMANIFEST` (spec section 8, scenario S6).
    pub fn with_gen2_manifest_quirk(mut self) -> Self {
        self.gen2_manifest_quirk = true;
        self
    }

    /// A clonable handle to this transport's internal state, to be taken
    /// before the transport is boxed into a `DfuDriver`.
    pub fn state_handle(&self) -> MockDfuStateHandle {
        MockDfuStateHandle(self.state.clone())
    }

    fn handle_getstatus(&self) -> Result<Vec<u8>, Error> {
        let state = self.state.lock().unwrap();
        let status_byte: u8 = state.status.into();
        let state_byte: u8 = state.device_state.into();
        Ok(vec![status_byte, 0, 0, 0, state_byte, 0])
    }

    fn handle_dnload(&self, setup: Setup, data: &[u8]) -> Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        match setup.w_value {
            0 => {
                // DfuSe command sublayer: 5-byte `[opcode, param_le32]`.
                if data.len() != 5 {
                    return Err(Error::Protocol(format!(
                        "mock dfu transport: malformed DfuSe command payload ({} bytes)",
                        data.len()
                    )));
                }
                let opcode = data[0];
                let param = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                match opcode {
                    DFUSE_SET_ADDRESS_POINTER => {
                        state.set_address_log.push(param);
                        state.current_address = param;
                    }
                    DFUSE_ERASE_SECTOR => state.erase_log.push(param),
                    other => {
                        return Err(Error::Protocol(format!(
                            "mock dfu transport: unsupported DfuSe opcode {other:#04x}"
                        )))
                    }
                }
                state.device_state = DeviceStateCode::dfuDNLOAD_IDLE;
                Ok(data.len())
            }
            2 => {
                if data.is_empty() {
                    // Zero-length DNLOAD triggers manifestation (spec
                    // section 4.D `leave()`).
                    state.device_state = if self.gen2_manifest_quirk {
                        DeviceStateCode::dfuDNLOAD_IDLE
                    } else {
                        DeviceStateCode::dfuMANIFEST
                    };
                } else {
                    let address = state.current_address;
                    state.download_log.push((address, data.to_vec()));
                    state.current_address += data.len() as u32;
                    state.device_state = DeviceStateCode::dfuDNLOAD_IDLE;
                }
                Ok(data.len())
            }
            other => Err(Error::Protocol(format!(
                "mock dfu transport: unsupported DNLOAD wValue {other}"
            ))),
        }
    }
}

impl Transport for MockDfuTransport {
    fn max_control_transfer_data_size(&self) -> usize {
        dfuse::DEFAULT_TRANSFER_SIZE as usize
    }

    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn control_in(&self, setup: Setup, _timeout: Duration) -> Result<Vec<u8>, Error> {
        match setup.b_request {
            DFU_GETSTATUS => self.handle_getstatus(),
            DFU_UPLOAD => Ok(vec![0u8; setup.w_length as usize]),
            other => Err(Error::Protocol(format!(
                "mock dfu transport: unexpected IN bRequest {other}"
            ))),
        }
    }

    fn control_out(&self, setup: Setup, data: &[u8], _timeout: Duration) -> Result<usize, Error> {
        match setup.b_request {
            DFU_DNLOAD => self.handle_dnload(setup, data),
            DFU_CLRSTATUS => {
                let mut state = self.state.lock().unwrap();
                state.status = DeviceStatusCode::OK;
                state.device_state = DeviceStateCode::dfuIDLE;
                Ok(0)
            }
            DFU_ABORT => {
                let mut state = self.state.lock().unwrap();
                state.device_state = DeviceStateCode::dfuIDLE;
                Ok(0)
            }
            DFU_DETACH => Ok(0),
            other => Err(Error::Protocol(format!(
                "mock dfu transport: unexpected OUT bRequest {other}"
            ))),
        }
    }

    fn claim_interface(&mut self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn set_alt_setting(&mut self, _interface: u8, _alt_setting: u8) -> Result<(), Error> {
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn serial_number(&self) -> Result<String, Error> {
        Ok(self.serial_number.clone())
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, Error> {
        if index == DFU_INTERFACE_STRING_INDEX {
            Ok(self.memory_descriptor.clone())
        } else {
            Err(Error::UsbStall)
        }
    }

    fn interface_descriptors(&self) -> Result<Vec<InterfaceDescriptor>, Error> {
        Ok(vec![InterfaceDescriptor {
            interface_number: 0,
            alternate_setting: 0,
            interface_class: crate::dfu::INTERFACE_CLASS_APPLICATION_SPECIFIC,
            interface_subclass: crate::dfu::INTERFACE_SUBCLASS_DFU,
            interface_string_index: Some(DFU_INTERFACE_STRING_INDEX),
            extra: Vec::new(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_assigns_sequential_nonzero_ids() {
        let transport = MockTransport::new(MockScript::new());
        let s1 = transport
            .handle_init(Setup::new(0xC0, INIT_REQUEST, 0, 1, 64))
            .unwrap();
        let s2 = transport
            .handle_init(Setup::new(0xC0, INIT_REQUEST, 0, 1, 64))
            .unwrap();
        let r1 = ServiceReply::decode(&s1).unwrap();
        let r2 = ServiceReply::decode(&s2).unwrap();
        assert_ne!(r1.id, r2.id);
        assert_ne!(r1.id, Some(0));
    }

    #[test]
    fn echo_returns_sent_bytes_via_recv() {
        let transport = MockTransport::new(MockScript::echo());
        let init = transport
            .handle_init(Setup::new(0xC0, INIT_REQUEST, 5, 1, 64))
            .unwrap();
        let id = ServiceReply::decode(&init).unwrap().id.unwrap();
        transport
            .control_out(Setup::new(0x40, SEND_REQUEST, 0, id, 5), b"hello", Duration::from_secs(1))
            .unwrap();
        let check = transport
            .handle_check(Setup::new(0xC0, CHECK_REQUEST, 0, id, 64))
            .unwrap();
        let reply = ServiceReply::decode(&check).unwrap();
        assert_eq!(reply.size, Some(5));
        let data = transport
            .handle_recv(Setup::new(0xC0, RECV_REQUEST, 0, id, 5))
            .unwrap();
        assert_eq!(data, b"hello");
    }
}
