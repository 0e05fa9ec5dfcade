//! USB DFU 1.1 + DfuSe driver. Reference: spec sections 4.D, 4.E, 4.F.
//!
//! Generalizes the teacher's `dfudev` module (which only ever targets
//! internal flash via `set_address_request`/`erase_page_request`) into the
//! general DFU state machine plus DfuSe command layer the spec requires,
//! including alt-setting selection, a memory-map cache, and a capability
//! probe for the vendor-extension opcodes the teacher never implements.

pub mod dfuse;
pub mod memory;
pub mod states;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub use dfuse::DfuseCommand;
pub use memory::{MemoryMap, ProgressEvent, Segment, SegmentAttrs};
pub use states::{DeviceStateCode, DeviceStatus, DeviceStatusCode};

use crate::transport::{Setup, Transport};
use crate::Error;

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

const BM_REQUEST_TYPE_OUT: u8 = 0x21;
const BM_REQUEST_TYPE_IN: u8 = 0xA1;

pub(crate) const INTERFACE_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
pub(crate) const INTERFACE_SUBCLASS_DFU: u8 = 0x01;
const DESCRIPTOR_TYPE_DFU_FUNCTIONAL: u8 = 0x21;

/// Vendor string descriptor index reporting DfuSe security/protection state
/// (spec section 4.G).
const PROTECTION_STRING_INDEX: u8 = 0xFA;

/// One DFU alt-setting discovered while walking the active configuration's
/// descriptors during `open` (spec section 4.D).
#[derive(Debug, Clone)]
#[allow(dead_code)]
struct DfuInterface {
    interface_number: u8,
    alt_setting: u8,
    string_index: Option<u8>,
    transfer_size: Option<u16>,
}

/// Options for [`DfuDriver::go_into_idle_state`] (spec section 4.D).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleOptions {
    /// Accept `dfuDNLOAD_IDLE` as already-idle, in addition to `dfuIDLE`.
    pub dnload_idle: bool,
    /// Accept `dfuUPLOAD_IDLE` as already-idle, in addition to `dfuIDLE`.
    pub upload_idle: bool,
}

/// Inferred protection/security state (spec section 4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Open,
    Protected,
    ServiceMode,
}

pub struct DfuDriver {
    transport: Box<dyn Transport>,
    interfaces: HashMap<u8, DfuInterface>,
    current_alt_setting: u8,
    transfer_size: u16,
    memory_map: Option<MemoryMap>,
    supported_dfuse_commands: Option<HashSet<u8>>,
}

impl DfuDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            interfaces: HashMap::new(),
            current_alt_setting: 0,
            transfer_size: dfuse::DEFAULT_TRANSFER_SIZE,
            memory_map: None,
            supported_dfuse_commands: None,
        }
    }

    /// Claims interface 0, walks the active configuration's descriptors for
    /// DFU interfaces/alt-settings, and selects alt-setting 0 (spec section
    /// 4.D).
    pub fn open(&mut self) -> Result<(), Error> {
        self.transport.open()?;
        self.transport.claim_interface(0)?;

        let descriptors = self.transport.interface_descriptors()?;
        let mut interfaces = HashMap::new();
        let mut pending_transfer_size = None;

        for desc in &descriptors {
            if desc.interface_class == INTERFACE_CLASS_APPLICATION_SPECIFIC
                && desc.interface_subclass == INTERFACE_SUBCLASS_DFU
            {
                pending_transfer_size = parse_dfu_functional_transfer_size(&desc.extra);
                interfaces.insert(
                    desc.alternate_setting,
                    DfuInterface {
                        interface_number: desc.interface_number,
                        alt_setting: desc.alternate_setting,
                        string_index: desc.interface_string_index,
                        transfer_size: pending_transfer_size,
                    },
                );
            }
        }

        if interfaces.is_empty() {
            return Err(Error::Protocol(
                "no DFU interface found in active configuration".into(),
            ));
        }

        self.interfaces = interfaces;
        self.set_alt_setting(0)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.transport.release_interface(0)?;
        self.transport.close()
    }

    /// Selects the interface `(bInterfaceNumber, bAlternateSetting)` pair for
    /// `alt_setting`, caching `wTransferSize` (falling back to
    /// `DEFAULT_TRANSFER_SIZE`) and parsing its memory descriptor (spec
    /// section 4.E).
    pub fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), Error> {
        let interface = self
            .interfaces
            .get(&alt_setting)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no DFU alt-setting {alt_setting}")))?;

        self.transport
            .set_alt_setting(interface.interface_number, alt_setting)?;

        self.transfer_size = interface
            .transfer_size
            .unwrap_or(dfuse::DEFAULT_TRANSFER_SIZE);
        self.current_alt_setting = alt_setting;

        self.memory_map = match interface.string_index {
            Some(index) => {
                let desc = self.transport.read_string_descriptor(index)?;
                Some(MemoryMap::parse(&desc)?)
            }
            None => None,
        };

        Ok(())
    }

    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    pub fn memory_map(&self) -> Result<&MemoryMap, Error> {
        self.memory_map
            .as_ref()
            .ok_or_else(|| Error::Dfu("no memory map for the selected alt-setting".into()))
    }

    // --- raw DFU requests (spec section 4.D) ---

    fn control_out(&self, b_request: u8, w_value: u16, data: &[u8]) -> Result<usize, Error> {
        let setup = Setup::new(BM_REQUEST_TYPE_OUT, b_request, w_value, 0, data.len() as u16);
        self.transport.control_out(setup, data, Duration::from_secs(5))
    }

    fn control_in(&self, b_request: u8, w_value: u16, w_length: u16) -> Result<Vec<u8>, Error> {
        let setup = Setup::new(BM_REQUEST_TYPE_IN, b_request, w_value, 0, w_length);
        self.transport.control_in(setup, Duration::from_secs(5))
    }

    pub fn get_status(&self) -> Result<DeviceStatus, Error> {
        let bytes = self.control_in(DFU_GETSTATUS, 0, 6)?;
        let buf: [u8; 6] = bytes
            .try_into()
            .map_err(|_| Error::Protocol("GET_STATUS reply was not 6 bytes".into()))?;
        DeviceStatus::decode(&buf)
    }

    pub fn clr_status(&self) -> Result<(), Error> {
        self.control_out(DFU_CLRSTATUS, 0, &[]).map(|_| ())
    }

    pub fn abort(&self) -> Result<(), Error> {
        self.control_out(DFU_ABORT, 0, &[]).map(|_| ())
    }

    pub fn detach(&self, timeout_ms: u16) -> Result<(), Error> {
        self.control_out(DFU_DETACH, timeout_ms, &[]).map(|_| ())
    }

    fn dnload(&self, w_value: u16, data: &[u8]) -> Result<(), Error> {
        self.control_out(DFU_DNLOAD, w_value, data).map(|_| ())
    }

    fn upload(&self, w_value: u16, w_length: u16) -> Result<Vec<u8>, Error> {
        self.control_in(DFU_UPLOAD, w_value, w_length)
    }

    /// Sends one download chunk at the DfuSe data `wValue` (2), after the
    /// target address has been set with `SET_ADDRESS_POINTER` (spec section
    /// 4.F).
    pub fn dnload_chunk(&self, chunk: &[u8]) -> Result<(), Error> {
        self.dnload(2, chunk)
    }

    /// Reads one upload block at DfuSe block number `block_number` (spec
    /// section 4.F: real data starts at block 2).
    pub fn upload_block(&self, block_number: u16, max_len: usize) -> Result<Vec<u8>, Error> {
        self.upload(block_number, max_len as u16)
    }

    // --- state machine (spec section 4.D) ---

    /// Repeatedly issues `GET_STATUS`, sleeping `pollTimeout` ms between
    /// calls, stopping when `predicate` holds or the device reports
    /// `dfuERROR`.
    pub fn poll_until(&self, predicate: impl Fn(&DeviceStatus) -> bool) -> Result<DeviceStatus, Error> {
        loop {
            let status = self.get_status()?;
            if predicate(&status) {
                return Ok(status);
            }
            if status.state == DeviceStateCode::dfuERROR {
                return Err(Error::DfuStatus {
                    status: status.status,
                    state: status.state,
                });
            }
            std::thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        }
    }

    /// Normalizes the device to an acceptable idle state (spec section
    /// 4.D).
    pub fn go_into_idle_state(&self, options: IdleOptions) -> Result<(), Error> {
        let is_acceptable = |state: DeviceStateCode| {
            state == DeviceStateCode::dfuIDLE
                || (options.dnload_idle && state == DeviceStateCode::dfuDNLOAD_IDLE)
                || (options.upload_idle && state == DeviceStateCode::dfuUPLOAD_IDLE)
        };

        let mut status = self.get_status()?;
        if status.state == DeviceStateCode::dfuERROR {
            self.clr_status()?;
            status = self.get_status()?;
        }

        if !is_acceptable(status.state) {
            // May itself fail and push the device into dfuERROR; a
            // subsequent CLR_STATUS (below) recovers it to dfuIDLE.
            let _ = self.clr_status();
            status = self.get_status()?;
            if status.state == DeviceStateCode::dfuERROR {
                self.clr_status()?;
                status = self.get_status()?;
            }
        }

        if !is_acceptable(status.state) {
            return Err(Error::Dfu(format!(
                "invalid state: expected idle, got {}",
                status.state
            )));
        }
        Ok(())
    }

    /// `DFU_ABORT` then `GET_STATUS`; recovers from `dfuERROR` with one
    /// `CLR_STATUS`; must end in `dfuIDLE` (spec section 4.D).
    pub fn abort_to_idle(&self) -> Result<(), Error> {
        self.abort()?;
        let mut status = self.get_status()?;
        if status.state == DeviceStateCode::dfuERROR {
            self.clr_status()?;
            status = self.get_status()?;
        }
        if status.state != DeviceStateCode::dfuIDLE {
            return Err(Error::Dfu(format!(
                "abort did not return to dfuIDLE, got {}",
                status.state
            )));
        }
        Ok(())
    }

    /// Normalizes to idle, sends a zero-length `DFU_DNLOAD`, then polls
    /// until manifestation completes. Accepts the Gen2 quirk of reporting
    /// `dfuDNLOAD_IDLE` instead of `dfuMANIFEST` (spec section 4.D, spec
    /// section 9 second ambiguity).
    pub fn leave(&self) -> Result<(), Error> {
        self.go_into_idle_state(IdleOptions {
            dnload_idle: true,
            upload_idle: false,
        })?;
        self.dnload(2, &[])?;
        self.poll_until(|s| {
            s.state == DeviceStateCode::dfuMANIFEST || s.state == DeviceStateCode::dfuDNLOAD_IDLE
        })?;
        Ok(())
    }

    // --- DfuSe command sublayer (spec section 4.E) ---

    fn ensure_dfuse_command_supported(&mut self, cmd: DfuseCommand) -> Result<(), Error> {
        if !cmd.is_vendor_extension() {
            return Ok(());
        }
        if self.supported_dfuse_commands.is_none() {
            let bytes = self.upload(0, self.transfer_size)?;
            self.supported_dfuse_commands = Some(dfuse::parse_command_list(&bytes));
        }
        let supported = self.supported_dfuse_commands.as_ref().unwrap();
        if supported.contains(&cmd.opcode()) {
            Ok(())
        } else {
            Err(Error::UnsupportedDfuseCommand(cmd.opcode()))
        }
    }

    /// Issues a DfuSe command: up to `MAX_COMMAND_ATTEMPTS` attempts of a
    /// zero-`wValue` `DFU_DNLOAD` with the 5-byte command payload, retrying
    /// on STALL with a 1s backoff; any other transport error is fatal.
    /// Polls until the device leaves `dfuDNBUSY`; the final status must be
    /// `OK` (spec section 4.E).
    pub fn dfuse_command(&mut self, cmd: DfuseCommand, param: u32) -> Result<(), Error> {
        self.ensure_dfuse_command_supported(cmd)?;

        let payload = dfuse::encode_command(cmd, param);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dnload(0, &payload) {
                Ok(()) => break,
                Err(err) if err.is_stall() && attempt < dfuse::MAX_COMMAND_ATTEMPTS => {
                    std::thread::sleep(dfuse::STALL_RETRY_DELAY);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        let status = self.poll_until(|s| s.state != DeviceStateCode::dfuDNBUSY)?;
        if status.status != DeviceStatusCode::OK {
            return Err(Error::DfuStatus {
                status: status.status,
                state: status.state,
            });
        }
        Ok(())
    }

    pub fn enter_safe_mode(&mut self) -> Result<(), Error> {
        self.dfuse_command(DfuseCommand::EnterSafeMode, 0)
    }

    pub fn clear_security_mode_override(&mut self) -> Result<(), Error> {
        self.dfuse_command(DfuseCommand::ClearSecurityModeOverride, 0)
    }

    /// Reads the DfuSe protection/security state. Primary path reads the
    /// `sm=<char>` vendor string at index `0xFA`; falls back (older
    /// firmware) to inferring protection from the internal-flash alt-setting's
    /// attributes (spec section 4.G).
    pub fn get_protection_state(&mut self) -> Result<ProtectionState, Error> {
        if let Ok(desc) = self.transport.read_string_descriptor(PROTECTION_STRING_INDEX) {
            if let Some(state) = parse_protection_string(&desc) {
                return Ok(state);
            }
        }

        // Fallback: select internal flash (conventionally alt-setting 0)
        // and infer from segment attributes.
        let alt = self.current_alt_setting;
        self.set_alt_setting(0)?;
        let map = self.memory_map()?;
        let all_erasable_only = map
            .segments
            .iter()
            .all(|s| s.erasable() && !s.writable() && !s.readable());
        let inferred = if all_erasable_only {
            ProtectionState::Protected
        } else {
            ProtectionState::Open
        };
        if alt != 0 {
            self.set_alt_setting(alt)?;
        }
        Ok(inferred)
    }
}

fn parse_protection_string(desc: &str) -> Option<ProtectionState> {
    let marker = "sm=";
    let idx = desc.find(marker)?;
    let c = desc[idx + marker.len()..].chars().next()?;
    match c {
        'o' => Some(ProtectionState::Open),
        'p' => Some(ProtectionState::Protected),
        's' => Some(ProtectionState::ServiceMode),
        _ => None,
    }
}

/// Looks for a 9-byte DFU_FUNCTIONAL sub-descriptor (type `0x21`) among an
/// interface's "extra" bytes and extracts `wTransferSize`.
fn parse_dfu_functional_transfer_size(extra: &[u8]) -> Option<u16> {
    let mut offset = 0;
    while offset + 1 < extra.len() {
        let length = extra[offset] as usize;
        if length == 0 || offset + length > extra.len() {
            break;
        }
        let descriptor_type = extra[offset + 1];
        if descriptor_type == DESCRIPTOR_TYPE_DFU_FUNCTIONAL && length == 9 {
            let bytes = &extra[offset..offset + 9];
            return Some(u16::from_le_bytes([bytes[5], bytes[6]]));
        }
        offset += length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sm_open() {
        assert_eq!(parse_protection_string("sm=o"), Some(ProtectionState::Open));
    }

    #[test]
    fn parses_sm_protected() {
        assert_eq!(
            parse_protection_string("foo sm=p bar"),
            Some(ProtectionState::Protected)
        );
    }

    #[test]
    fn parses_sm_service_mode() {
        assert_eq!(
            parse_protection_string("sm=s"),
            Some(ProtectionState::ServiceMode)
        );
    }

    #[test]
    fn rejects_missing_marker() {
        assert_eq!(parse_protection_string("nothing here"), None);
    }

    #[test]
    fn extracts_dfu_functional_transfer_size() {
        let extra = [0x09, 0x21, 0x0B, 0x00, 0x08, 0x00, 0x04, 0x10, 0x01];
        assert_eq!(parse_dfu_functional_transfer_size(&extra), Some(0x0400));
    }

    #[test]
    fn no_functional_descriptor_returns_none() {
        assert_eq!(parse_dfu_functional_transfer_size(&[]), None);
    }
}
