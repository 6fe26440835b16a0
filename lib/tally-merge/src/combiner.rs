//! The query-time variant of the merge ring.
//!
//! A combiner covers a fixed `[start, start + count * span)` window and
//! never flushes: everything stays resident until the response is encoded.
//! Records outside the window are dropped, and the caller supplies the key
//! under which a record is aggregated, which is how grouping projections
//! (module roll-up, per-host, ...) are applied.

use std::collections::hash_map::Entry;

use tally_protocol::buf::{CorruptSnafu, DecodeError, EncodeError, Reader, Writer};
use tally_protocol::record::{MergedGauge, MergedLcall, MergedRcall, Record};
use tally_protocol::types::{LocalKey, RcallKey};
use tally_protocol::{Frequency, FrequencyError};

use crate::merger::{GaugeMap, LcallMap, RcallMap};

#[derive(Debug)]
pub struct Combiner {
    freq: Frequency,
    span: i64,
    period_start: i64,
    period_count: usize,
    gauges: Vec<GaugeMap>,
    lcalls: Vec<LcallMap>,
    rcalls: Vec<RcallMap>,
}

impl Combiner {
    pub fn new(
        freq: Frequency,
        period_start: i64,
        period_count: usize,
    ) -> Result<Self, FrequencyError> {
        let span = freq.span_millis()?;
        let period_count = period_count.max(crate::merger::MIN_PERIODS);

        Ok(Combiner {
            freq,
            span,
            period_start,
            period_count,
            gauges: (0..period_count).map(|_| GaugeMap::new()).collect(),
            lcalls: (0..period_count).map(|_| LcallMap::new()).collect(),
            rcalls: (0..period_count).map(|_| RcallMap::new()).collect(),
        })
    }

    pub fn freq(&self) -> Frequency {
        self.freq
    }

    pub fn period_start(&self) -> i64 {
        self.period_start
    }

    pub fn period_count(&self) -> usize {
        self.period_count
    }

    pub fn gauges(&self) -> &[GaugeMap] {
        &self.gauges
    }

    pub fn lcalls(&self) -> &[LcallMap] {
        &self.lcalls
    }

    pub fn rcalls(&self) -> &[RcallMap] {
        &self.rcalls
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.iter().all(GaugeMap::is_empty)
            && self.lcalls.iter().all(LcallMap::is_empty)
            && self.rcalls.iter().all(RcallMap::is_empty)
    }

    fn bucket_of(&self, ts: i64) -> i64 {
        self.freq
            .bucket_start(ts)
            .expect("frequency validated by the constructor")
    }

    fn index_of(&self, ts: i64) -> Option<usize> {
        let index = (self.bucket_of(ts) - self.period_start).div_euclid(self.span);
        if index < 0 || index >= self.period_count as i64 {
            return None;
        }
        Some(index as usize)
    }

    /// Aggregate `gauge` under `key`; the stored record carries the key's
    /// identity, not the incoming record's.
    pub fn add_merged_gauge(&mut self, key: LocalKey, gauge: &MergedGauge) {
        let Some(index) = self.index_of(gauge.timestamp) else {
            return;
        };
        let period = self.bucket_of(gauge.timestamp);

        match self.gauges[index].entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(gauge),
            Entry::Vacant(entry) => {
                entry.insert(MergedGauge {
                    timestamp: period,
                    host: key.host,
                    sid: key.sid,
                    freq: self.freq,
                    kind: gauge.kind,
                    value: gauge.value,
                });
            }
        }
    }

    pub fn add_merged_lcall(&mut self, key: LocalKey, lcall: &MergedLcall) {
        let Some(index) = self.index_of(lcall.timestamp) else {
            return;
        };
        let period = self.bucket_of(lcall.timestamp);

        match self.lcalls[index].entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(lcall),
            Entry::Vacant(entry) => {
                entry.insert(MergedLcall {
                    timestamp: period,
                    host: key.host,
                    sid: key.sid,
                    freq: self.freq,
                    rets: lcall.rets.clone(),
                });
            }
        }
    }

    pub fn add_merged_rcall(&mut self, key: RcallKey, rcall: &MergedRcall) {
        let Some(index) = self.index_of(rcall.timestamp) else {
            return;
        };
        let period = self.bucket_of(rcall.timestamp);

        match self.rcalls[index].entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(rcall),
            Entry::Vacant(entry) => {
                entry.insert(MergedRcall {
                    timestamp: period,
                    src_host: key.src.host,
                    src_sid: key.src.sid,
                    dst_host: key.dst.host,
                    dst_sid: key.dst.sid,
                    freq: self.freq,
                    rets: rcall.rets.clone(),
                });
            }
        }
    }

    /// Aggregate a merged record under its own identity. Item records are
    /// not accepted at query time; callers filter them out beforehand.
    pub fn add_record(&mut self, record: &Record) {
        match record {
            Record::MergedGauge(gauge) => {
                self.add_merged_gauge(LocalKey::new(gauge.host, gauge.sid), gauge);
            }
            Record::MergedLcall(lcall) => {
                self.add_merged_lcall(LocalKey::new(lcall.host, lcall.sid), lcall);
            }
            Record::MergedRcall(rcall) => self.add_merged_rcall(rcall.key(), rcall),
            Record::Gauge(_) | Record::Lcall(_) | Record::Rcall(_) => {}
        }
    }

    /// Re-aggregate everything held here into `dst`, projecting each local
    /// key through `project`. Remote-call pairs keep their identity; there
    /// is no defined roll-up for them.
    pub fn fold_into<F>(&self, dst: &mut Combiner, project: F)
    where
        F: Fn(&LocalKey) -> LocalKey,
    {
        for bucket in &self.gauges {
            for (key, gauge) in bucket {
                dst.add_merged_gauge(project(key), gauge);
            }
        }
        for bucket in &self.lcalls {
            for (key, lcall) in bucket {
                dst.add_merged_lcall(project(key), lcall);
            }
        }
        for bucket in &self.rcalls {
            for (key, rcall) in bucket {
                dst.add_merged_rcall(*key, rcall);
            }
        }
    }

    /// Wire layout: frequency, window origin and bucket count, then each
    /// bucket as three counted runs of full record frames.
    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        self.freq.encode(writer)?;
        writer.put_i64(self.period_start)?;
        writer.put_u16(self.period_count.min(u16::MAX as usize) as u16)?;

        for i in 0..self.period_count {
            encode_run(writer, self.gauges[i].values().map(|g| Record::MergedGauge(g.clone())))?;
            encode_run(writer, self.lcalls[i].values().map(|c| Record::MergedLcall(c.clone())))?;
            encode_run(writer, self.rcalls[i].values().map(|c| Record::MergedRcall(c.clone())))?;
        }

        Ok(())
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<Combiner, DecodeError> {
        let freq = Frequency::parse(reader)?;
        let period_start = reader.get_i64()?;
        let period_count = reader.get_u16()? as usize;

        let mut combiner =
            Combiner::new(freq, period_start, period_count).map_err(|_| {
                CorruptSnafu {
                    offset: reader.position(),
                    reason: "combiner frequency has no bucket length",
                }
                .build()
            })?;

        // the constructor may widen a degenerate count; decode what the
        // wire actually carries
        for index in 0..period_count {
            for _ in 0..3 {
                // gauge, lcall, rcall runs in order
                let count = reader.get_u16()? as usize;
                for _ in 0..count {
                    let offset = reader.position();
                    match Record::parse(reader)? {
                        Record::MergedGauge(gauge) => {
                            combiner.gauges[index]
                                .insert(LocalKey::new(gauge.host, gauge.sid), gauge);
                        }
                        Record::MergedLcall(lcall) => {
                            combiner.lcalls[index]
                                .insert(LocalKey::new(lcall.host, lcall.sid), lcall);
                        }
                        Record::MergedRcall(rcall) => {
                            combiner.rcalls[index].insert(rcall.key(), rcall);
                        }
                        _ => {
                            return CorruptSnafu {
                                offset,
                                reason: "item record inside a combiner body",
                            }
                            .fail()
                        }
                    }
                }
            }
        }

        Ok(combiner)
    }
}

fn encode_run<I>(writer: &mut Writer<'_>, records: I) -> Result<(), EncodeError>
where
    I: ExactSizeIterator<Item = Record>,
{
    writer.put_u16(records.len().min(u16::MAX as usize) as u16)?;
    for record in records.take(u16::MAX as usize) {
        record.encode(writer)?;
    }
    Ok(())
}
