//! The agent/storage message envelope and request bodies.
//!
//! Every message is a fixed 16-byte little-endian header followed by a
//! body; `len` covers the whole message so the envelope is self-framing on
//! a byte stream. Responses echo the request's `syn` in `ack` and lead the
//! body with an `i32` status.

use crate::buf::{DecodeError, EncodeError, Reader, Writer};
use crate::freq::Frequency;
use crate::types::HostAddr;

pub const HEADER_LEN: usize = 16;

/// Protocol version stamped into every header.
pub const WIRE_VERSION: u8 = 1;

/// Command codes.
pub mod cmd {
    pub const REPORT_HOSTINFO_REQ: u16 = 1;
    pub const REPORT_HOSTINFO_RSP: u16 = 2;
    pub const SAVE_STATS_REQ: u16 = 3;
    pub const SAVE_STATS_RSP: u16 = 4;
    pub const GET_SYSTEM_STATS_REQ: u16 = 5;
    pub const GET_SYSTEM_STATS_RSP: u16 = 6;
}

/// Response status codes; the leading `i32` of every response body.
pub mod status {
    pub const OK: i32 = 0;
    pub const MISSING_PARAMETER: i32 = 101;
    pub const QUERY_FAILED: i32 = 102;
    pub const ENCODE_FAILED: i32 = 103;
    pub const UNKNOWN_COMMAND: i32 = 104;
    pub const SAVE_FAILED: i32 = 105;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total message length, header included.
    pub len: u32,
    pub cmd: u16,
    pub ver: u8,
    pub flags: u8,
    pub syn: u32,
    pub ack: u32,
}

impl MsgHeader {
    pub fn request(cmd: u16, syn: u32) -> Self {
        MsgHeader {
            len: 0,
            cmd,
            ver: WIRE_VERSION,
            flags: 0,
            syn,
            ack: 0,
        }
    }

    pub fn response(cmd: u16, syn: u32, ack: u32) -> Self {
        MsgHeader {
            len: 0,
            cmd,
            ver: WIRE_VERSION,
            flags: 0,
            syn,
            ack,
        }
    }

    /// Pack into exactly [`HEADER_LEN`] bytes at the front of `out`.
    pub fn write_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..6].copy_from_slice(&self.cmd.to_le_bytes());
        out[6] = self.ver;
        out[7] = self.flags;
        out[8..12].copy_from_slice(&self.syn.to_le_bytes());
        out[12..16].copy_from_slice(&self.ack.to_le_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> Option<MsgHeader> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(MsgHeader {
            len: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            cmd: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
            ver: bytes[6],
            flags: bytes[7],
            syn: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            ack: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

/// Query context: business ids are translated to resource ids before the
/// scan, resource ids are used as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryContext {
    Business = 0,
    Resource = 1,
}

/// Body of `GET_SYSTEM_STATS_REQ`.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemStatsRequest {
    pub context: QueryContext,
    pub total_view: bool,
    /// Query window `[start, end)` in epoch milliseconds.
    pub start: i64,
    pub end: i64,
    /// Span of one response bucket.
    pub span: Frequency,
    /// Product filter; 0 means any.
    pub pid: u16,
    /// Module filter; 0 means any.
    pub mid: u16,
    pub iids: Vec<u16>,
    /// Host filter; empty means any.
    pub hosts: Vec<HostAddr>,
}

impl SystemStatsRequest {
    pub fn parse(reader: &mut Reader<'_>) -> Result<SystemStatsRequest, DecodeError> {
        let context = match reader.get_u8()? {
            0 => QueryContext::Business,
            _ => QueryContext::Resource,
        };
        let total_view = reader.get_u8()? != 0;
        let start = reader.get_i64()?;
        let end = reader.get_i64()?;
        let span = Frequency::parse(reader)?;
        let pid = reader.get_u16()?;
        let mid = reader.get_u16()?;

        let iid_count = reader.get_u16()? as usize;
        let mut iids = Vec::with_capacity(iid_count);
        for _ in 0..iid_count {
            iids.push(reader.get_u16()?);
        }

        let host_count = reader.get_u16()? as usize;
        let mut hosts = Vec::with_capacity(host_count);
        for _ in 0..host_count {
            hosts.push(HostAddr::parse(reader)?);
        }

        Ok(SystemStatsRequest {
            context,
            total_view,
            start,
            end,
            span,
            pid,
            mid,
            iids,
            hosts,
        })
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u8(self.context as u8)?;
        writer.put_u8(self.total_view as u8)?;
        writer.put_i64(self.start)?;
        writer.put_i64(self.end)?;
        self.span.encode(writer)?;
        writer.put_u16(self.pid)?;
        writer.put_u16(self.mid)?;

        writer.put_u16(self.iids.len().min(u16::MAX as usize) as u16)?;
        for iid in self.iids.iter().take(u16::MAX as usize) {
            writer.put_u16(*iid)?;
        }

        writer.put_u16(self.hosts.len().min(u16::MAX as usize) as u16)?;
        for host in self.hosts.iter().take(u16::MAX as usize) {
            host.encode(writer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq::FreqUnit;
    use bytes::BytesMut;

    #[test]
    fn header_round_trips() {
        let header = MsgHeader {
            len: 1234,
            cmd: cmd::SAVE_STATS_REQ,
            ver: WIRE_VERSION,
            flags: 0,
            syn: 42,
            ack: 0,
        };

        let mut bytes = [0u8; HEADER_LEN];
        header.write_into(&mut bytes);
        assert_eq!(MsgHeader::read_from(&bytes), Some(header));
        assert!(MsgHeader::read_from(&bytes[..15]).is_none());
    }

    #[test]
    fn stats_request_round_trips() {
        let request = SystemStatsRequest {
            context: QueryContext::Resource,
            total_view: true,
            start: 1_622_505_600_000,
            end: 1_622_516_400_000,
            span: Frequency::new(FreqUnit::Hour, 1),
            pid: 1,
            mid: 2,
            iids: vec![crate::iids::LOADAVG_1, crate::iids::MEM_USED],
            hosts: vec![HostAddr::V4([127, 0, 0, 1])],
        };

        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 4096);
        request.encode(&mut writer).unwrap();

        let mut reader = Reader::new(&buf);
        assert_eq!(SystemStatsRequest::parse(&mut reader).unwrap(), request);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_request_is_missing_parameter_material() {
        let request = SystemStatsRequest {
            context: QueryContext::Resource,
            total_view: false,
            start: 0,
            end: 3_600_000,
            span: Frequency::new(FreqUnit::Minute, 1),
            pid: 1,
            mid: 0,
            iids: vec![crate::iids::LOADAVG_1],
            hosts: vec![],
        };

        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 4096);
        request.encode(&mut writer).unwrap();

        let mut reader = Reader::new(&buf[..buf.len() - 3]);
        assert!(SystemStatsRequest::parse(&mut reader)
            .unwrap_err()
            .is_retryable());
    }
}
