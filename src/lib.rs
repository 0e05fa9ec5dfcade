//! Host-side library mediating the vendor request/reply protocol and USB
//! DFU 1.1 + DfuSe to embedded devices over a single USB control endpoint.
//!
//! Two independent transports are spoken on the same endpoint, never both at
//! once for a given device: the [`engine`] module multiplexes application
//! requests when the device runs application firmware, and the [`dfu`]
//! module drives the DFU state machine and DfuSe command layer when the
//! device is in firmware-update mode. [`device::Device`] is the façade that
//! opens a device, identifies it, and routes to whichever backend applies.
//!
//! Enumeration filters (vendor/product ID registries), application-level
//! request encoding, and CLI/packaging concerns are out of scope; see the
//! top of the project's design notes for the full boundary.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod codec;
pub mod device;
pub mod dfu;
pub mod engine;
mod error;
pub mod mock;
pub mod transport;

pub use device::{Config, Device, DeviceState};
pub use error::Error;
