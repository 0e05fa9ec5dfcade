//! Device façade. Reference: spec section 4.G.
//!
//! Generalizes the teacher's single-purpose `dfudev::DfuDevice` (always DFU)
//! into the dual-mode handle section 2 requires: on `open`, it probes the
//! active configuration's interface class/subclass and routes to either the
//! vendor request engine (`engine::Engine`) or the DFU driver (`dfu::DfuDriver`),
//! never both at once.

use std::time::Duration;

use crate::dfu::{
    DfuDriver, ProtectionState, INTERFACE_CLASS_APPLICATION_SPECIFIC, INTERFACE_SUBCLASS_DFU,
};
use crate::engine::{
    normalize_serial, CloseOptions, ControlReply, Engine, EngineOptions, Identity, Payload,
    SendOptions, DEFAULT_REQUEST_TIMEOUT,
};
use crate::transport::{RusbTransport, Transport};
use crate::Error;

/// Façade-construction options (spec section 9: "accept a configuration
/// object at façade construction; avoid process-wide mutables").
#[derive(Debug, Clone)]
pub struct Config {
    /// `auto` (unbounded until the device signals BUSY) when `None`.
    pub concurrent_requests: Option<usize>,
    /// Default per-request timeout, used when a caller doesn't override it.
    pub request_timeout: Duration,
    /// Default `close()` timeout, used when a caller doesn't override it.
    pub close_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_requests: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrent_requests(mut self, n: usize) -> Self {
        self.concurrent_requests = Some(n);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of a [`Device`] handle (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// The engine or DFU driver a device is served by once open; never both
/// (spec section 3: "either a request engine or a DFU driver, never both
/// active simultaneously").
enum Backend {
    Vendor(Engine),
    Dfu(DfuDriver),
}

/// A handle to one USB device, created in `Closed` state by [`Device::enumerate`]
/// and mutated only by `open`/`close` (spec section 3).
pub struct Device {
    state: DeviceState,
    transport: Option<Box<dyn Transport>>,
    identity: Option<Identity>,
    backend: Option<Backend>,
}

impl Device {
    /// Wraps an already-constructed transport as a `Closed` handle. Exposed
    /// for callers (and tests) supplying their own `Transport`, e.g. the
    /// in-memory mock.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            state: DeviceState::Closed,
            transport: Some(transport),
            identity: None,
            backend: None,
        }
    }

    /// Lists every USB device visible to the host backend, each as a
    /// `Closed` handle. Filtering to relevant vendor/product IDs is a
    /// registry concern left to the caller (spec section 1).
    pub fn enumerate() -> Result<Vec<Self>, Error> {
        Ok(RusbTransport::enumerate()?
            .into_iter()
            .map(|dev| Device::from_transport(Box::new(RusbTransport::new(dev))))
            .collect())
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// `None` until after a successful `open()`.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// True once `open()` has routed this device to the DFU driver.
    pub fn is_dfu(&self) -> bool {
        matches!(self.backend, Some(Backend::Dfu(_)))
    }

    /// Opens the transport, identifies the device, and selects the engine or
    /// DFU driver (spec section 4.G: "open -> identify -> select engine").
    /// On any failure the handle returns to `Closed` and the error
    /// propagates (spec section 4.C open semantics, generalized to both
    /// backends).
    pub fn open(&mut self, config: Config) -> Result<(), Error> {
        if self.state != DeviceState::Closed {
            return Err(Error::State {
                state: "not closed",
                detail: "open() called on a device that is already open or closing",
            });
        }
        self.state = DeviceState::Opening;

        match self.try_open(config) {
            Ok(()) => {
                self.state = DeviceState::Open;
                Ok(())
            }
            Err(err) => {
                self.state = DeviceState::Closed;
                Err(err)
            }
        }
    }

    fn try_open(&mut self, config: Config) -> Result<(), Error> {
        let mut transport = self
            .transport
            .take()
            .ok_or(Error::Internal("device has no transport to open"))?;

        // Both backends need an open handle to read descriptors/strings;
        // `Transport::open` is idempotent, so the backend's own `open()`
        // re-opening it below is harmless (spec section 4.A).
        transport.open()?;
        let serial_number = normalize_serial(&transport.serial_number()?);
        let descriptors = transport.interface_descriptors()?;
        let is_dfu = descriptors.iter().any(|d| {
            d.interface_class == INTERFACE_CLASS_APPLICATION_SPECIFIC
                && d.interface_subclass == INTERFACE_SUBCLASS_DFU
        });

        if is_dfu {
            let mut dfu = DfuDriver::new(transport);
            dfu.open()?;
            self.identity = Some(Identity {
                serial_number,
                firmware_version: None,
            });
            self.backend = Some(Backend::Dfu(dfu));
        } else {
            let (engine, identity) = Engine::open(
                transport,
                EngineOptions {
                    concurrent_requests: config.concurrent_requests,
                },
            )?;
            self.identity = Some(identity);
            self.backend = Some(Backend::Vendor(engine));
        }
        Ok(())
    }

    /// Tears down whichever backend is active. Tolerant of transport errors:
    /// they are logged and the handle still finalizes as `Closed` (spec
    /// section 4.G, section 7: "errors during close are logged and
    /// swallowed").
    pub fn close(&mut self, options: CloseOptions) -> Result<(), Error> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        self.state = DeviceState::Closing;

        let result = match self.backend.take() {
            Some(Backend::Vendor(engine)) => engine.close(options),
            Some(Backend::Dfu(mut dfu)) => dfu.close(),
            None => Ok(()),
        };
        if let Err(err) = &result {
            log::warn!("error while closing device: {err}");
        }
        self.identity = None;
        self.state = DeviceState::Closed;
        Ok(())
    }

    /// Convenience close using `config`'s default close timeout and waiting
    /// for pending requests (spec section 4.C default close semantics).
    pub fn close_gracefully(&mut self, config: &Config) -> Result<(), Error> {
        self.close(CloseOptions {
            process_pending_requests: true,
            timeout: config.close_timeout,
        })
    }

    /// Issues a vendor-protocol request. Only valid once `open()` has routed
    /// to the vendor engine (spec section 4.C).
    pub fn send_control_request(
        &self,
        request_type: i64,
        data: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<ControlReply, Error> {
        match &self.backend {
            Some(Backend::Vendor(engine)) => engine.send_control_request(request_type, data, options),
            Some(Backend::Dfu(_)) => Err(Error::State {
                state: "dfu-mode",
                detail: "send_control_request() is only valid for vendor-protocol devices",
            }),
            None => Err(not_open_error()),
        }
    }

    /// Forwards to `DFU.leave` (spec section 4.C: "`reset()` -- DFU-mode
    /// devices only").
    pub fn reset(&mut self) -> Result<(), Error> {
        match &mut self.backend {
            Some(Backend::Dfu(dfu)) => dfu.leave(),
            Some(Backend::Vendor(_)) => Err(Error::State {
                state: "vendor-mode",
                detail: "reset() is only valid for DFU-mode devices",
            }),
            None => Err(not_open_error()),
        }
    }

    /// Reads the DfuSe protection/security state (spec section 4.G).
    pub fn get_protection_state(&mut self) -> Result<ProtectionState, Error> {
        match &mut self.backend {
            Some(Backend::Dfu(dfu)) => dfu.get_protection_state(),
            Some(Backend::Vendor(_)) => Err(Error::State {
                state: "vendor-mode",
                detail: "get_protection_state() is only valid for DFU-mode devices",
            }),
            None => Err(not_open_error()),
        }
    }

    /// Direct access to the DFU driver for erase/download/upload operations
    /// (`dfu::memory`), `None` outside DFU mode.
    pub fn dfu_driver_mut(&mut self) -> Option<&mut DfuDriver> {
        match &mut self.backend {
            Some(Backend::Dfu(dfu)) => Some(dfu),
            _ => None,
        }
    }
}

fn not_open_error() -> Error {
    Error::State {
        state: "closed",
        detail: "device is not open",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockScript, MockTransport};

    #[test]
    fn open_routes_vendor_devices_to_the_engine() {
        let mut device = Device::from_transport(Box::new(MockTransport::new(MockScript::new())));
        device.open(Config::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Open);
        assert!(!device.is_dfu());
        assert_eq!(device.identity().unwrap().serial_number, "mock-serial-0001");
    }

    #[test]
    fn reset_rejected_on_vendor_mode_device() {
        let mut device = Device::from_transport(Box::new(MockTransport::new(MockScript::new())));
        device.open(Config::default()).unwrap();
        assert!(matches!(device.reset(), Err(Error::State { .. })));
    }

    #[test]
    fn close_is_idempotent_when_already_closed() {
        let mut device = Device::from_transport(Box::new(MockTransport::new(MockScript::new())));
        device.open(Config::default()).unwrap();
        device.close(CloseOptions::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Closed);
        device.close(CloseOptions::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn send_control_request_rejected_before_open() {
        let device = Device::from_transport(Box::new(MockTransport::new(MockScript::new())));
        let err = device
            .send_control_request(1, Vec::<u8>::new(), SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }
}
