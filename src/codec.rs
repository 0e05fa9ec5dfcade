//! Wire codec for the vendor request/reply protocol.
//!
//! Builds the five setup packets (INIT/CHECK/SEND/RECV/RESET) and decodes
//! the little-endian service-reply frame the device sends back on INIT and
//! CHECK.

use bitflags::bitflags;
use byteorder::{ByteOrder, LE};
use num_enum::TryFromPrimitive;

use crate::transport::Setup;
use crate::Error;

/// `bRequest` values for the five vendor services.
mod request {
    pub const INIT: u8 = 1;
    pub const CHECK: u8 = 2;
    pub const SEND: u8 = 3;
    pub const RECV: u8 = 4;
    pub const RESET: u8 = 5;
}

const BM_REQUEST_TYPE_IN: u8 = 0xC0;
const BM_REQUEST_TYPE_OUT: u8 = 0x40;

/// Default `wLength` for the three fixed-size control services.
const FIXED_REPLY_LENGTH: u16 = 64;

bitflags! {
    /// Which optional fields are present in a service-reply frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyFlags: u32 {
        const STATUS = 0x01;
        const ID = 0x02;
        const SIZE = 0x04;
        const RESULT = 0x08;
    }
}

/// Status codes carried in a service-reply frame.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ServiceStatus {
    Ok = 0,
    Error = 1,
    Pending = 2,
    Busy = 3,
    NoMemory = 4,
    NotFound = 5,
}

/// A decoded service-reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: ServiceStatus,
    pub id: Option<u16>,
    pub size: Option<u32>,
    pub result: Option<i32>,
}

impl ServiceReply {
    /// Decodes a frame: `u32 flags | u16 status | [u16 id] | [u32 size] | [i32 result]`.
    ///
    /// STATUS is mandatory; unknown flag bits are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::Protocol("reply shorter than the flags field".into()));
        }
        let raw_flags = LE::read_u32(&buf[0..4]);
        let flags = ReplyFlags::from_bits_truncate(raw_flags);
        if !flags.contains(ReplyFlags::STATUS) {
            return Err(Error::Protocol("reply missing mandatory STATUS field".into()));
        }

        let mut offset = 4;
        let mut take = |len: usize| -> Result<&[u8], Error> {
            let end = offset + len;
            let slice = buf
                .get(offset..end)
                .ok_or_else(|| Error::Protocol("reply truncated before a flagged field".into()))?;
            offset = end;
            Ok(slice)
        };

        let status_raw = LE::read_u16(take(2)?);
        let status = ServiceStatus::try_from(status_raw)
            .map_err(|_| Error::Protocol(format!("unknown service status {status_raw}")))?;

        let id = if flags.contains(ReplyFlags::ID) {
            Some(LE::read_u16(take(2)?))
        } else {
            None
        };
        let size = if flags.contains(ReplyFlags::SIZE) {
            Some(LE::read_u32(take(4)?))
        } else {
            None
        };
        let result = if flags.contains(ReplyFlags::RESULT) {
            Some(LE::read_i32(take(4)?))
        } else {
            None
        };

        Ok(Self {
            status,
            id,
            size,
            result,
        })
    }

    /// Encodes a frame. The real device is the only encoder in production
    /// use; this exists for the in-memory mock transport used by this
    /// crate's integration tests and for round-trip unit tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = ReplyFlags::STATUS;
        if self.id.is_some() {
            flags |= ReplyFlags::ID;
        }
        if self.size.is_some() {
            flags |= ReplyFlags::SIZE;
        }
        if self.result.is_some() {
            flags |= ReplyFlags::RESULT;
        }

        let mut buf = Vec::with_capacity(4 + 2 + 8);
        let mut push_u32 = |v: u32, buf: &mut Vec<u8>| {
            let mut tmp = [0u8; 4];
            LE::write_u32(&mut tmp, v);
            buf.extend_from_slice(&tmp);
        };
        push_u32(flags.bits(), &mut buf);
        let mut push_u16 = |v: u16, buf: &mut Vec<u8>| {
            let mut tmp = [0u8; 2];
            LE::write_u16(&mut tmp, v);
            buf.extend_from_slice(&tmp);
        };
        push_u16(self.status as u16, &mut buf);
        if let Some(id) = self.id {
            push_u16(id, &mut buf);
        }
        if let Some(size) = self.size {
            push_u32(size, &mut buf);
        }
        if let Some(result) = self.result {
            let mut tmp = [0u8; 4];
            LE::write_i32(&mut tmp, result);
            buf.extend_from_slice(&tmp);
        }
        buf
    }
}

/// Validates a value fits `u16` (any request type, payload size, or
/// protocol id in `[0, 0xFFFF]` is valid) so callers passing a wider integer
/// type get a clean `Error::Range` instead of a silent truncation.
pub fn check_u16_range(value: u32, what: &'static str) -> Result<u16, Error> {
    u16::try_from(value).map_err(|_| Error::Range(format!("{what} {value} exceeds u16 range")))
}

pub fn build_init_setup(request_type: u16, payload_size: u16) -> Setup {
    Setup::new(
        BM_REQUEST_TYPE_IN,
        request::INIT,
        payload_size,
        request_type,
        FIXED_REPLY_LENGTH,
    )
}

pub fn build_check_setup(protocol_id: u16) -> Setup {
    Setup::new(BM_REQUEST_TYPE_IN, request::CHECK, 0, protocol_id, FIXED_REPLY_LENGTH)
}

pub fn build_send_setup(protocol_id: u16, chunk_len: u16) -> Setup {
    Setup::new(BM_REQUEST_TYPE_OUT, request::SEND, 0, protocol_id, chunk_len)
}

pub fn build_recv_setup(protocol_id: u16, chunk_len: u16) -> Setup {
    Setup::new(BM_REQUEST_TYPE_IN, request::RECV, 0, protocol_id, chunk_len)
}

/// `protocol_id = 0` resets all in-flight requests on the device.
pub fn build_reset_setup(protocol_id: u16) -> Setup {
    Setup::new(BM_REQUEST_TYPE_IN, request::RESET, 0, protocol_id, FIXED_REPLY_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_optional_fields() {
        let reply = ServiceReply {
            status: ServiceStatus::Ok,
            id: Some(7),
            size: Some(1234),
            result: Some(-1),
        };
        let encoded = reply.encode();
        let decoded = ServiceReply::decode(&encoded).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn round_trips_status_only() {
        let reply = ServiceReply {
            status: ServiceStatus::Pending,
            id: None,
            size: None,
            result: None,
        };
        let encoded = reply.encode();
        let decoded = ServiceReply::decode(&encoded).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn missing_status_is_protocol_error() {
        let mut buf = vec![0u8; 4];
        LE::write_u32(&mut buf, 0); // no flags set
        assert!(ServiceReply::decode(&buf).is_err());
    }

    #[test]
    fn unknown_flag_bits_are_ignored() {
        let mut reply = ServiceReply {
            status: ServiceStatus::Ok,
            id: None,
            size: None,
            result: None,
        };
        let mut encoded = reply.encode();
        let raw = LE::read_u32(&encoded[0..4]) | 0x8000_0000;
        LE::write_u32(&mut encoded[0..4], raw);
        let decoded = ServiceReply::decode(&encoded).unwrap();
        reply.id = decoded.id;
        assert_eq!(decoded.status, reply.status);
    }

    #[test]
    fn truncated_flagged_field_is_protocol_error() {
        let reply = ServiceReply {
            status: ServiceStatus::Ok,
            id: Some(1),
            size: None,
            result: None,
        };
        let mut encoded = reply.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(ServiceReply::decode(&encoded).is_err());
    }

    #[test]
    fn setup_builders_match_spec_table() {
        let s = build_init_setup(0x10, 0x20);
        assert_eq!((s.bm_request_type, s.b_request, s.w_value, s.w_index, s.w_length), (0xC0, 1, 0x20, 0x10, 64));

        let s = build_check_setup(9);
        assert_eq!((s.bm_request_type, s.b_request, s.w_value, s.w_index, s.w_length), (0xC0, 2, 0, 9, 64));

        let s = build_send_setup(9, 512);
        assert_eq!((s.bm_request_type, s.b_request, s.w_value, s.w_index, s.w_length), (0x40, 3, 0, 9, 512));

        let s = build_recv_setup(9, 512);
        assert_eq!((s.bm_request_type, s.b_request, s.w_value, s.w_index, s.w_length), (0xC0, 4, 0, 9, 512));

        let s = build_reset_setup(0);
        assert_eq!((s.bm_request_type, s.b_request, s.w_value, s.w_index, s.w_length), (0xC0, 5, 0, 0, 64));
    }
}
