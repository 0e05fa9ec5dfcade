//! Application request record. Reference: spec section 3 ("Application
//! request record").

use std::sync::mpsc::Sender;
use std::time::Instant;

use crate::engine::policy::PollingPolicy;
use crate::Error;

/// Input payload, preserving whether the caller passed text (so the reply is
/// decoded symmetrically) or raw bytes (spec section 3: "text vs binary
/// flag").
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(s) => s.as_bytes(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

/// A reply payload, decoded as text if the originating request was text
/// (spec section 3, section 4.C CHECK/dataSent table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyData {
    Bytes(Vec<u8>),
    Text(String),
}

/// Successful resolution of a `sendControlRequest` (spec section 4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub result: i32,
    pub data: Option<ReplyData>,
}

pub(crate) struct Record {
    pub id: u64,
    pub request_type: u16,
    pub payload: Payload,
    pub protocol_id: u16,
    pub data_sent: bool,
    pub done: bool,
    pub check_policy: PollingPolicy,
    pub check_attempt: u32,
    pub check_due: Option<Instant>,
    pub timeout_deadline: Option<Instant>,
    pub timeout_value: Option<std::time::Duration>,
    pub reply_tx: Option<Sender<Result<ControlReply, Error>>>,
}

impl Record {
    pub fn new(
        id: u64,
        request_type: u16,
        payload: Payload,
        check_policy: PollingPolicy,
        timeout_deadline: Option<Instant>,
        reply_tx: Sender<Result<ControlReply, Error>>,
    ) -> Self {
        Self {
            id,
            request_type,
            payload,
            protocol_id: 0,
            data_sent: false,
            done: false,
            check_policy,
            check_attempt: 0,
            check_due: None,
            timeout_deadline,
            timeout_value: None,
            reply_tx: Some(reply_tx),
        }
    }

    /// Resolves or rejects the record exactly once; subsequent calls are a
    /// no-op (spec section 3 invariant: "once done ... callbacks are
    /// single-shot").
    pub fn complete(&mut self, result: Result<ControlReply, Error>) {
        self.done = true;
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(result);
        }
    }

    pub fn schedule_check(&mut self, now: Instant) {
        let delay_ms = self.check_policy.delay_ms(self.check_attempt);
        self.check_due = Some(now + std::time::Duration::from_millis(delay_ms));
    }
}
