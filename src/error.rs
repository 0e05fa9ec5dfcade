//! Crate-wide error type.
//!
//! Reference: spec section 7 ("Error Handling Design"). Every kind listed
//! there gets exactly one variant here; sub-kinds (e.g. `UsbStall` under
//! `Usb`) get their own variant rather than a nested enum, since nothing
//! downstream needs to match on the parent kind without the sub-kind.

use crate::dfu::{DeviceStateCode, DeviceStatusCode};

/// Errors produced by this crate's device, engine, and DFU layers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation invalid in the handle's current lifecycle state.
    #[error("invalid operation in state {state}: {detail}")]
    State { state: &'static str, detail: &'static str },

    /// Client-supplied value outside its allowed range.
    #[error("value out of range: {0}")]
    Range(String),

    /// A per-request or close timeout expired.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Transport-level failure.
    #[error("USB transport error: {0}")]
    Usb(String),

    /// Transport-level failure specifically identified as a STALL.
    #[error("USB transport stalled")]
    UsbStall,

    /// A service reply or DFU response was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device reported NO_MEMORY for a request.
    #[error("device is out of memory for this request")]
    Memory,

    /// The device could not be found, or reported NOT_FOUND for a CHECK.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Inconsistent DFU-layer state.
    #[error("DFU state error: {0}")]
    Dfu(String),

    /// The device reported an error status for a DFU operation.
    #[error("device reported DFU status {status:?} while in state {state:?}")]
    DfuStatus {
        status: DeviceStatusCode,
        state: DeviceStateCode,
    },

    /// Attempted to erase/write/read a segment whose attributes forbid it.
    #[error("segment at {address:#010x} does not permit {operation}")]
    DeviceProtection {
        address: u32,
        operation: &'static str,
    },

    /// A required DfuSe command is missing from the device's GET_COMMAND list.
    #[error("DfuSe command {0:#04x} is not supported by this device")]
    UnsupportedDfuseCommand(u8),

    /// The device returned a non-OK application-level result code.
    #[error("request failed with result code {0}")]
    Request(i32),

    /// The request was cancelled (reset queued, timer cancelled) before completion.
    #[error("request was cancelled")]
    Cancelled,

    /// An invariant the crate asserts was violated; indicates an internal bug.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl Error {
    /// True if this error represents a USB STALL condition.
    pub fn is_stall(&self) -> bool {
        matches!(self, Error::UsbStall)
    }
}
