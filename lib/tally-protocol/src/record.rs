//! The on-disk and on-wire record codec.
//!
//! Every frame is a one-byte kind tag followed by a fixed or
//! length-prefixed payload; there is no outer delimiter, so a stream is
//! simply frames back to back. Decoding a partial frame fails with
//! `NotEnough` and leaves the read cursor untouched, which is what lets the
//! tailer re-feed the same bytes once the writer has finished its append.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use crate::buf::{CorruptSnafu, DecodeError, EncodeError, Reader, Writer};
use crate::freq::Frequency;
use crate::types::{CallResult, HostAddr, LocalKey, MergedResult, RcallKey, StatId};

/// Byte cap for call `key` fields.
pub const KEY_MAX: usize = 128;
/// Byte cap for call `extra` fields.
pub const EXTRA_MAX: usize = 256;

/// Cap on retcode map entries in a merged call record; the encoder clamps
/// and the decoder refuses counts it cannot represent.
pub const RETCODE_MAP_MAX: usize = u16::MAX as usize;

/// Frame kind tags as they appear on disk and on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    ItemGauge = 0,
    ItemLcall = 1,
    ItemRcall = 2,
    MergedGauge = 3,
    MergedLcall = 4,
    MergedRcall = 5,
}

impl RecordKind {
    pub fn from_byte(b: u8) -> Option<RecordKind> {
        Some(match b {
            0 => RecordKind::ItemGauge,
            1 => RecordKind::ItemLcall,
            2 => RecordKind::ItemRcall,
            3 => RecordKind::MergedGauge,
            4 => RecordKind::MergedLcall,
            5 => RecordKind::MergedRcall,
            _ => return None,
        })
    }
}

/// How a gauge sample combines with an earlier sample in the same bucket:
/// a `Snapshot` replaces it, a `Delta` adds to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GaugeKind {
    Snapshot = 0,
    Delta = 1,
}

impl GaugeKind {
    fn parse(reader: &mut Reader<'_>) -> Result<GaugeKind, DecodeError> {
        let offset = reader.position();
        match reader.get_u8()? {
            0 => Ok(GaugeKind::Snapshot),
            1 => Ok(GaugeKind::Delta),
            _ => CorruptSnafu {
                offset,
                reason: "gauge kind byte out of range",
            }
            .fail(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GaugeSample {
    pub timestamp: i64,
    pub host: HostAddr,
    pub sid: StatId,
    pub kind: GaugeKind,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallSample {
    pub timestamp: i64,
    pub host: HostAddr,
    pub sid: StatId,
    pub retcode: i32,
    pub result: CallResult,
    pub key: String,
    pub extra: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCallSample {
    pub timestamp: i64,
    pub src_host: HostAddr,
    pub src_sid: StatId,
    pub dst_host: HostAddr,
    pub dst_sid: StatId,
    pub retcode: i32,
    pub result: CallResult,
    pub key: String,
    pub extra: String,
}

/// One bucket's aggregate for a gauge series. `timestamp` is the bucket
/// start, not the time of any single sample.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedGauge {
    pub timestamp: i64,
    pub host: HostAddr,
    pub sid: StatId,
    pub freq: Frequency,
    pub kind: GaugeKind,
    pub value: i64,
}

impl MergedGauge {
    /// Fold another aggregate of the same series and bucket into this one.
    pub fn absorb(&mut self, other: &MergedGauge) {
        match other.kind {
            GaugeKind::Snapshot => {
                self.kind = other.kind;
                self.value = other.value;
            }
            GaugeKind::Delta => {
                self.kind = other.kind;
                self.value = self.value.wrapping_add(other.value);
            }
        }
    }

    /// Fold a raw sample into this aggregate.
    pub fn absorb_sample(&mut self, sample: &GaugeSample) {
        match sample.kind {
            GaugeKind::Snapshot => {
                self.kind = sample.kind;
                self.value = sample.value;
            }
            GaugeKind::Delta => {
                self.kind = sample.kind;
                self.value = self.value.wrapping_add(sample.value);
            }
        }
    }
}

pub type RetcodeMap = HashMap<i32, MergedResult>;

/// Fold `src` into `dst` retcode by retcode.
pub fn merge_retcodes(dst: &mut RetcodeMap, src: &RetcodeMap) {
    for (retcode, mresult) in src {
        dst.entry(*retcode)
            .and_modify(|existing| existing.absorb(*mresult))
            .or_insert(*mresult);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedLcall {
    pub timestamp: i64,
    pub host: HostAddr,
    pub sid: StatId,
    pub freq: Frequency,
    pub rets: RetcodeMap,
}

impl MergedLcall {
    pub fn absorb(&mut self, other: &MergedLcall) {
        merge_retcodes(&mut self.rets, &other.rets);
    }

    pub fn absorb_sample(&mut self, retcode: i32, result: CallResult) {
        self.rets
            .entry(retcode)
            .and_modify(|existing| existing.absorb_sample(result))
            .or_insert_with(|| MergedResult::first(result));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedRcall {
    pub timestamp: i64,
    pub src_host: HostAddr,
    pub src_sid: StatId,
    pub dst_host: HostAddr,
    pub dst_sid: StatId,
    pub freq: Frequency,
    pub rets: RetcodeMap,
}

impl MergedRcall {
    pub fn key(&self) -> RcallKey {
        RcallKey::new(
            LocalKey::new(self.src_host, self.src_sid),
            LocalKey::new(self.dst_host, self.dst_sid),
        )
    }

    pub fn absorb(&mut self, other: &MergedRcall) {
        merge_retcodes(&mut self.rets, &other.rets);
    }

    pub fn absorb_sample(&mut self, retcode: i32, result: CallResult) {
        self.rets
            .entry(retcode)
            .and_modify(|existing| existing.absorb_sample(result))
            .or_insert_with(|| MergedResult::first(result));
    }
}

/// A decoded frame of any kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Gauge(GaugeSample),
    Lcall(CallSample),
    Rcall(RemoteCallSample),
    MergedGauge(MergedGauge),
    MergedLcall(MergedLcall),
    MergedRcall(MergedRcall),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Gauge(_) => RecordKind::ItemGauge,
            Record::Lcall(_) => RecordKind::ItemLcall,
            Record::Rcall(_) => RecordKind::ItemRcall,
            Record::MergedGauge(_) => RecordKind::MergedGauge,
            Record::MergedLcall(_) => RecordKind::MergedLcall,
            Record::MergedRcall(_) => RecordKind::MergedRcall,
        }
    }

    /// Sample time for items, bucket start for merged records.
    pub fn timestamp(&self) -> i64 {
        match self {
            Record::Gauge(g) => g.timestamp,
            Record::Lcall(c) => c.timestamp,
            Record::Rcall(c) => c.timestamp,
            Record::MergedGauge(g) => g.timestamp,
            Record::MergedLcall(c) => c.timestamp,
            Record::MergedRcall(c) => c.timestamp,
        }
    }

    /// Decode one frame. On any failure the read cursor is restored to
    /// where it was on entry.
    pub fn parse(reader: &mut Reader<'_>) -> Result<Record, DecodeError> {
        let mut txn = reader.begin();
        let record = parse_record(&mut txn)?;
        txn.commit();
        Ok(record)
    }

    /// Encode one frame, tag byte included. On failure nothing is left in
    /// the output.
    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        let mut txn = writer.begin();
        encode_record(&mut txn, self)?;
        txn.commit();
        Ok(())
    }
}

fn parse_record(reader: &mut Reader<'_>) -> Result<Record, DecodeError> {
    let tag_offset = reader.position();
    let tag = reader.get_u8()?;
    let kind = RecordKind::from_byte(tag).ok_or_else(|| {
        CorruptSnafu {
            offset: tag_offset,
            reason: "unknown record kind tag",
        }
        .build()
    })?;

    let record = match kind {
        RecordKind::ItemGauge => Record::Gauge(GaugeSample {
            timestamp: reader.get_i64()?,
            host: HostAddr::parse(reader)?,
            sid: StatId::parse(reader)?,
            kind: GaugeKind::parse(reader)?,
            value: reader.get_i64()?,
        }),
        RecordKind::ItemLcall => Record::Lcall(CallSample {
            timestamp: reader.get_i64()?,
            host: HostAddr::parse(reader)?,
            sid: StatId::parse(reader)?,
            retcode: reader.get_i32()?,
            result: CallResult::parse(reader)?,
            key: reader.get_string(KEY_MAX)?,
            extra: reader.get_string(EXTRA_MAX)?,
        }),
        RecordKind::ItemRcall => Record::Rcall(RemoteCallSample {
            timestamp: reader.get_i64()?,
            src_host: HostAddr::parse(reader)?,
            src_sid: StatId::parse(reader)?,
            dst_host: HostAddr::parse(reader)?,
            dst_sid: StatId::parse(reader)?,
            retcode: reader.get_i32()?,
            result: CallResult::parse(reader)?,
            key: reader.get_string(KEY_MAX)?,
            extra: reader.get_string(EXTRA_MAX)?,
        }),
        RecordKind::MergedGauge => Record::MergedGauge(MergedGauge {
            timestamp: reader.get_i64()?,
            host: HostAddr::parse(reader)?,
            sid: StatId::parse(reader)?,
            freq: Frequency::parse(reader)?,
            kind: GaugeKind::parse(reader)?,
            value: reader.get_i64()?,
        }),
        RecordKind::MergedLcall => {
            let timestamp = reader.get_i64()?;
            let host = HostAddr::parse(reader)?;
            let sid = StatId::parse(reader)?;
            let freq = Frequency::parse(reader)?;
            let rets = parse_retcodes(reader)?;
            Record::MergedLcall(MergedLcall {
                timestamp,
                host,
                sid,
                freq,
                rets,
            })
        }
        RecordKind::MergedRcall => {
            let timestamp = reader.get_i64()?;
            let src_host = HostAddr::parse(reader)?;
            let src_sid = StatId::parse(reader)?;
            let dst_host = HostAddr::parse(reader)?;
            let dst_sid = StatId::parse(reader)?;
            let freq = Frequency::parse(reader)?;
            let rets = parse_retcodes(reader)?;
            Record::MergedRcall(MergedRcall {
                timestamp,
                src_host,
                src_sid,
                dst_host,
                dst_sid,
                freq,
                rets,
            })
        }
    };

    Ok(record)
}

fn parse_retcodes(reader: &mut Reader<'_>) -> Result<RetcodeMap, DecodeError> {
    let count = reader.get_u16()? as usize;
    let mut rets = RetcodeMap::with_capacity(count);
    for _ in 0..count {
        let retcode = reader.get_i32()?;
        let mresult = MergedResult::parse(reader)?;
        rets.insert(retcode, mresult);
    }
    Ok(rets)
}

fn encode_record(writer: &mut Writer<'_>, record: &Record) -> Result<(), EncodeError> {
    writer.put_u8(record.kind() as u8)?;

    match record {
        Record::Gauge(g) => {
            writer.put_i64(g.timestamp)?;
            g.host.encode(writer)?;
            g.sid.encode(writer)?;
            writer.put_u8(g.kind as u8)?;
            writer.put_i64(g.value)?;
        }
        Record::Lcall(c) => {
            writer.put_i64(c.timestamp)?;
            c.host.encode(writer)?;
            c.sid.encode(writer)?;
            writer.put_i32(c.retcode)?;
            c.result.encode(writer)?;
            writer.put_string(&c.key, KEY_MAX)?;
            writer.put_string(&c.extra, EXTRA_MAX)?;
        }
        Record::Rcall(c) => {
            writer.put_i64(c.timestamp)?;
            c.src_host.encode(writer)?;
            c.src_sid.encode(writer)?;
            c.dst_host.encode(writer)?;
            c.dst_sid.encode(writer)?;
            writer.put_i32(c.retcode)?;
            c.result.encode(writer)?;
            writer.put_string(&c.key, KEY_MAX)?;
            writer.put_string(&c.extra, EXTRA_MAX)?;
        }
        Record::MergedGauge(g) => {
            writer.put_i64(g.timestamp)?;
            g.host.encode(writer)?;
            g.sid.encode(writer)?;
            g.freq.encode(writer)?;
            writer.put_u8(g.kind as u8)?;
            writer.put_i64(g.value)?;
        }
        Record::MergedLcall(c) => {
            writer.put_i64(c.timestamp)?;
            c.host.encode(writer)?;
            c.sid.encode(writer)?;
            c.freq.encode(writer)?;
            encode_retcodes(writer, &c.rets)?;
        }
        Record::MergedRcall(c) => {
            writer.put_i64(c.timestamp)?;
            c.src_host.encode(writer)?;
            c.src_sid.encode(writer)?;
            c.dst_host.encode(writer)?;
            c.dst_sid.encode(writer)?;
            c.freq.encode(writer)?;
            encode_retcodes(writer, &c.rets)?;
        }
    }

    Ok(())
}

fn encode_retcodes(writer: &mut Writer<'_>, rets: &RetcodeMap) -> Result<(), EncodeError> {
    let count = rets.len().min(RETCODE_MAP_MAX);
    writer.put_u16(count as u16)?;
    for (retcode, mresult) in rets.iter().take(count) {
        writer.put_i32(*retcode)?;
        mresult.encode(writer)?;
    }
    Ok(())
}

/// Decode every whole frame at the front of `buf`, handing each to `each`,
/// and advance `buf` past them. A trailing partial frame stays in place for
/// the caller to extend.
///
/// Returns the number of frames decoded, or `Corrupt` once an undecodable
/// frame is reached; whole frames before the bad one have already been
/// consumed and delivered, and the bad bytes are left at the front of `buf`
/// for the caller to dispose of.
pub fn drain_frames<F>(buf: &mut BytesMut, mut each: F) -> Result<usize, DecodeError>
where
    F: FnMut(Record),
{
    let mut reader = Reader::new(&buf[..]);
    let mut decoded = 0;
    let result = loop {
        match Record::parse(&mut reader) {
            Ok(record) => {
                each(record);
                decoded += 1;
            }
            Err(DecodeError::NotEnough { .. }) => break Ok(decoded),
            Err(err) => break Err(err),
        }
    };

    let consumed = reader.position();
    buf.advance(consumed);
    result
}
