//! USB transport capability.
//!
//! Everything above this module talks to the device only through the
//! [`Transport`] trait, never through `rusb` directly. That keeps the engine
//! (`engine`) and the DFU driver (`dfu`) testable against an in-memory fake
//! and keeps a second host USB backend a matter of implementing one trait.

use std::time::Duration;

use crate::error::Error;

/// One USB control-transfer setup packet (minus the data stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setup {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl Setup {
    pub fn new(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> Self {
        Self {
            bm_request_type,
            b_request,
            w_value,
            w_index,
            w_length,
        }
    }
}

/// A raw configuration descriptor, enough for the engine and the DFU driver
/// to walk interfaces/alt-settings without depending on a specific backend's
/// descriptor types.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_string_index: Option<u8>,
    /// Raw bytes of any class-specific ("extra") descriptors following this
    /// interface descriptor, e.g. the DFU_FUNCTIONAL descriptor (type 0x21).
    pub extra: Vec<u8>,
}

/// Abstract host USB backend. See spec section 4.A.
///
/// `open`/`close` are idempotent from the caller's point of view: calling
/// either twice in a row is not an error.
pub trait Transport: Send {
    /// Maximum number of bytes this backend can carry in one control-transfer
    /// data stage. Chunked SEND/RECV (engine) and DfuSe download/upload
    /// (dfu::memory) both split around this value.
    fn max_control_transfer_data_size(&self) -> usize;

    fn open(&mut self) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;

    /// Device-to-host control transfer. Reads exactly `setup.w_length` bytes
    /// (the setup packet fully determines the data-stage length).
    fn control_in(&self, setup: Setup, timeout: Duration) -> Result<Vec<u8>, Error>;

    /// Host-to-device control transfer whose data stage is `data`.
    fn control_out(&self, setup: Setup, data: &[u8], timeout: Duration) -> Result<usize, Error>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), Error>;
    fn release_interface(&mut self, interface: u8) -> Result<(), Error>;
    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), Error>;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;

    /// The device's serial number string descriptor, read via its device
    /// descriptor's `iSerialNumber` index (spec section 4.A accessors).
    fn serial_number(&self) -> Result<String, Error>;

    /// Reads a string descriptor by index in the device's first supported
    /// language. Returns `Ok(String::new())` semantics are left to callers;
    /// implementations surface a missing descriptor as `Error::Usb`.
    fn read_string_descriptor(&self, index: u8) -> Result<String, Error>;

    /// Interface descriptors of the currently active configuration, in
    /// descriptor order, interleaved with any DFU_FUNCTIONAL descriptor
    /// bytes in `extra` the way USB descriptor walking naturally produces
    /// them.
    fn interface_descriptors(&self) -> Result<Vec<InterfaceDescriptor>, Error>;
}

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The real backend, thin wrapper over `rusb`.
///
/// Mirrors the way the teacher's `dfudev::DfuDevice` owns a `rusb::Device`
/// plus an `Option<rusb::DeviceHandle>` and opens descriptors lazily.
pub struct RusbTransport {
    device: rusb::Device<rusb::GlobalContext>,
    handle: Option<rusb::DeviceHandle<rusb::GlobalContext>>,
    language: Option<rusb::Language>,
}

impl RusbTransport {
    pub fn new(device: rusb::Device<rusb::GlobalContext>) -> Self {
        Self {
            device,
            handle: None,
            language: None,
        }
    }

    /// Enumerate all USB devices visible to the backend. Filtering to
    /// relevant vendor/product IDs is a registry concern (out of scope,
    /// spec section 1) left to the caller.
    pub fn enumerate() -> Result<Vec<rusb::Device<rusb::GlobalContext>>, Error> {
        Ok(rusb::devices()
            .map_err(|e| Error::Usb(e.to_string()))?
            .iter()
            .collect())
    }

    fn handle(&self) -> Result<&rusb::DeviceHandle<rusb::GlobalContext>, Error> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Usb("device not open".into()))
    }

    fn map_rusb_err(err: rusb::Error) -> Error {
        if err == rusb::Error::Pipe {
            Error::UsbStall
        } else {
            Error::Usb(err.to_string())
        }
    }
}

impl Transport for RusbTransport {
    fn max_control_transfer_data_size(&self) -> usize {
        // rusb has no portable MTU query; 4096 covers every backend in
        // practice and matches what the DfuSe `wTransferSize` fallback
        // (`DEFAULT_TRANSFER_SIZE`, dfu::dfuse) is scaled against.
        4096
    }

    fn open(&mut self) -> Result<(), Error> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.device.open().map_err(Self::map_rusb_err)?;
        if let Ok(langs) = handle.read_languages(DEFAULT_TIMEOUT) {
            self.language = langs.into_iter().next();
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.handle = None;
        Ok(())
    }

    fn control_in(&self, setup: Setup, timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; setup.w_length as usize];
        let n = self
            .handle()?
            .read_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                &mut buf,
                timeout,
            )
            .map_err(Self::map_rusb_err)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_out(&self, setup: Setup, data: &[u8], timeout: Duration) -> Result<usize, Error> {
        self.handle()?
            .write_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                data,
                timeout,
            )
            .map_err(Self::map_rusb_err)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), Error> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Usb("device not open".into()))?
            .claim_interface(interface)
            .map_err(Self::map_rusb_err)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), Error> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Usb("device not open".into()))?
            .release_interface(interface)
            .map_err(Self::map_rusb_err)
    }

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), Error> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Usb("device not open".into()))?
            .set_alternate_setting(interface, alt_setting)
            .map_err(Self::map_rusb_err)
    }

    fn vendor_id(&self) -> u16 {
        self.device
            .device_descriptor()
            .map(|d| d.vendor_id())
            .unwrap_or_default()
    }

    fn product_id(&self) -> u16 {
        self.device
            .device_descriptor()
            .map(|d| d.product_id())
            .unwrap_or_default()
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, Error> {
        let handle = self.handle()?;
        let language = self
            .language
            .ok_or_else(|| Error::Usb("no language available".into()))?;
        handle
            .read_string_descriptor(language, index, DEFAULT_TIMEOUT)
            .map_err(Self::map_rusb_err)
    }

    fn serial_number(&self) -> Result<String, Error> {
        let handle = self.handle()?;
        let language = self
            .language
            .ok_or_else(|| Error::Usb("no language available".into()))?;
        let device_desc = self.device.device_descriptor().map_err(Self::map_rusb_err)?;
        handle
            .read_serial_number_string(language, &device_desc, DEFAULT_TIMEOUT)
            .map_err(Self::map_rusb_err)
    }

    fn interface_descriptors(&self) -> Result<Vec<InterfaceDescriptor>, Error> {
        let device_desc = self
            .device
            .device_descriptor()
            .map_err(Self::map_rusb_err)?;
        let mut out = Vec::new();
        for n in 0..device_desc.num_configurations() {
            let config_desc = match self.device.config_descriptor(n) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for interface in config_desc.interfaces() {
                for desc in interface.descriptors() {
                    out.push(InterfaceDescriptor {
                        interface_number: desc.interface_number(),
                        alternate_setting: desc.setting_number(),
                        interface_class: desc.class_code(),
                        interface_subclass: desc.sub_class_code(),
                        interface_string_index: desc.description_string_index(),
                        extra: desc.extra().map(|e| e.to_vec()).unwrap_or_default(),
                    });
                }
            }
        }
        Ok(out)
    }
}
