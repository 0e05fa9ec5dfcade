//! DFU status/state byte codes, per USB DFU 1.1 section 6.1.2.
//!
//! Numeric values are compared directly throughout the crate; `Display`
//! below is the only place a symbolic name is rendered, reserved for log
//! lines and error messages.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Response to `DFU_GETSTATUS`. See DFU 1.1 section 6.1.2.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[allow(non_camel_case_types)]
pub enum DeviceStatusCode {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0A,
    errVENDOR = 0x0B,
    errUSBR = 0x0C,
    errPOR = 0x0D,
    errUNKNOWN = 0x0E,
    errSTALLEDPKT = 0x0F,
}

impl DeviceStatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::OK)
    }

    /// Human-readable description, used only at diagnostic boundaries
    /// (logging, `Display`), never for control flow.
    pub fn description(&self) -> &'static str {
        use DeviceStatusCode::*;
        match self {
            OK => "no error condition is present",
            errTARGET => "file is not targeted for use by this device",
            errFILE => "file fails a vendor-specific verification test",
            errWRITE => "device is unable to write memory",
            errERASE => "memory erase function failed",
            errCHECK_ERASED => "memory erase check failed",
            errPROG => "program memory function failed",
            errVERIFY => "programmed memory failed verification",
            errADDRESS => "address out of range",
            errNOTDONE => "zero-length DNLOAD received before all data arrived",
            errFIRMWARE => "device firmware is corrupt",
            errVENDOR => "vendor-specific error, see iString",
            errUSBR => "unexpected USB reset",
            errPOR => "unexpected power-on reset",
            errUNKNOWN => "unknown error",
            errSTALLEDPKT => "device stalled an unexpected request",
        }
    }
}

impl std::fmt::Display for DeviceStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", *self as u8, self.description())
    }
}

/// DFU state machine state. See DFU 1.1 section 6.1.2.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[allow(non_camel_case_types)]
pub enum DeviceStateCode {
    appIDLE = 0,
    appDETACH = 1,
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
}

impl std::fmt::Display for DeviceStateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Parsed `DFU_GETSTATUS` response (6 bytes): status, 24-bit poll timeout,
/// state, `iString` index.
#[derive(Debug, Clone, Copy)]
pub struct DeviceStatus {
    pub status: DeviceStatusCode,
    pub poll_timeout_ms: u32,
    pub state: DeviceStateCode,
    pub i_string: u8,
}

impl DeviceStatus {
    pub fn decode(buf: &[u8; 6]) -> Result<Self, crate::Error> {
        let status = DeviceStatusCode::try_from(buf[0])
            .map_err(|_| crate::Error::Protocol(format!("unknown DFU status byte {:#04x}", buf[0])))?;
        let poll_timeout_ms = u32::from(buf[1]) | (u32::from(buf[2]) << 8) | (u32::from(buf[3]) << 16);
        let state = DeviceStateCode::try_from(buf[4])
            .map_err(|_| crate::Error::Protocol(format!("unknown DFU state byte {:#04x}", buf[4])))?;
        Ok(Self {
            status,
            poll_timeout_ms,
            state,
            i_string: buf[5],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_status_response() {
        let buf = [0x00, 0x64, 0x00, 0x00, 0x02, 0x00];
        let status = DeviceStatus::decode(&buf).unwrap();
        assert_eq!(status.status, DeviceStatusCode::OK);
        assert_eq!(status.poll_timeout_ms, 100);
        assert_eq!(status.state, DeviceStateCode::dfuIDLE);
    }

    #[test]
    fn decodes_24bit_poll_timeout() {
        let buf = [0x00, 0xFF, 0xFF, 0x00, 0x02, 0x00];
        let status = DeviceStatus::decode(&buf).unwrap();
        assert_eq!(status.poll_timeout_ms, 0xFFFF);
    }

    #[test]
    fn rejects_unknown_status_byte() {
        let buf = [0xAA, 0, 0, 0, 0x02, 0];
        assert!(DeviceStatus::decode(&buf).is_err());
    }

    #[test]
    fn rejects_unknown_state_byte() {
        let buf = [0x00, 0, 0, 0, 0xAA, 0];
        assert!(DeviceStatus::decode(&buf).is_err());
    }
}
