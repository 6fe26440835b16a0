//! The sliding ring of time buckets that turns raw samples into per-bucket
//! merged records.
//!
//! The ring holds `period_count` consecutive buckets; bucket 0 starts at
//! `period_start`. A sample landing beyond the newest bucket pushes the
//! window forward, flushing every bucket that falls off the front to the
//! sink. Samples older than bucket 0 are dropped: the bucket they belong to
//! has already been flushed and re-opening it would double-count downstream.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;

use tally_protocol::record::{
    CallSample, GaugeSample, MergedGauge, MergedLcall, MergedRcall, Record, RemoteCallSample,
    RetcodeMap,
};
use tally_protocol::types::{LocalKey, MergedResult, RcallKey};
use tally_protocol::{Frequency, FrequencyError};

pub type GaugeMap = HashMap<LocalKey, MergedGauge>;
pub type LcallMap = HashMap<LocalKey, MergedLcall>;
pub type RcallMap = HashMap<RcallKey, MergedRcall>;

/// Receives ownership of each flushed bucket map. Implementations decide
/// what "save" means: the agent batches them onto the storage flow, tests
/// collect them.
pub trait MergedSink {
    fn save_gauges(&mut self, gauges: GaugeMap);
    fn save_lcalls(&mut self, lcalls: LcallMap);
    fn save_rcalls(&mut self, rcalls: RcallMap);
}

/// A ring shorter than this cannot absorb mildly out-of-order samples.
pub const MIN_PERIODS: usize = 2;

pub struct Merger<S> {
    sink: S,
    freq: Frequency,
    span: i64,
    /// Start of bucket 0; zero means no sample has arrived yet.
    period_start: i64,
    period_count: usize,
    gauges: Vec<GaugeMap>,
    lcalls: Vec<LcallMap>,
    rcalls: Vec<RcallMap>,
    dropped: u64,
}

impl<S: MergedSink> Merger<S> {
    /// Fails for month/year frequencies, which have no fixed bucket length.
    pub fn new(freq: Frequency, period_count: usize, sink: S) -> Result<Self, FrequencyError> {
        let span = freq.span_millis()?;
        let period_count = period_count.max(MIN_PERIODS);

        Ok(Merger {
            sink,
            freq,
            span,
            period_start: 0,
            period_count,
            gauges: (0..period_count).map(|_| GaugeMap::new()).collect(),
            lcalls: (0..period_count).map(|_| LcallMap::new()).collect(),
            rcalls: (0..period_count).map(|_| RcallMap::new()).collect(),
            dropped: 0,
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

    /// Samples dropped for arriving after their bucket was flushed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn bucket_of(&self, ts: i64) -> i64 {
        self.freq
            .bucket_start(ts)
            .expect("frequency validated by the constructor")
    }

    /// Pick the ring slot for `ts`, sliding the window forward if needed.
    /// `None` means the sample is too old and has been counted as dropped.
    fn locate(&mut self, ts: i64) -> Option<usize> {
        let period = self.bucket_of(ts);

        if self.period_start == 0 {
            // First sample lands in the newest slot so the ring has room
            // for stragglers just behind it.
            self.period_start = period - self.span * (self.period_count as i64 - 1);
            return Some(self.period_count - 1);
        }

        let index = (period - self.period_start).div_euclid(self.span);
        if index < 0 {
            self.dropped += 1;
            return None;
        }

        let index = index as usize;
        if index >= self.period_count {
            self.move_ahead(index - self.period_count + 1);
            return Some(self.period_count - 1);
        }

        Some(index)
    }

    /// Slide the window forward by `n` buckets, flushing everything that
    /// falls off the front in bucket order (gauges, then lcalls, then
    /// rcalls within each bucket).
    fn move_ahead(&mut self, n: usize) {
        for i in 0..n.min(self.period_count) {
            if !self.gauges[i].is_empty() {
                self.sink.save_gauges(mem::take(&mut self.gauges[i]));
            }
            if !self.lcalls[i].is_empty() {
                self.sink.save_lcalls(mem::take(&mut self.lcalls[i]));
            }
            if !self.rcalls[i].is_empty() {
                self.sink.save_rcalls(mem::take(&mut self.rcalls[i]));
            }
        }

        if n < self.period_count {
            self.gauges.rotate_left(n);
            self.lcalls.rotate_left(n);
            self.rcalls.rotate_left(n);
        }

        self.period_start += self.span * n as i64;
    }

    /// Flush every non-empty bucket. Called on shutdown so the tail of the
    /// stream is not stranded in memory.
    pub fn flush(&mut self) {
        if self.period_start != 0 {
            self.move_ahead(self.period_count);
        }
    }

    /// Feed one decoded frame into the ring.
    pub fn add(&mut self, record: &Record) {
        match record {
            Record::Gauge(sample) => self.add_gauge(sample),
            Record::Lcall(sample) => self.add_lcall(sample),
            Record::Rcall(sample) => self.add_rcall(sample),
            Record::MergedGauge(merged) => self.add_merged_gauge(merged),
            Record::MergedLcall(merged) => self.add_merged_lcall(merged),
            Record::MergedRcall(merged) => self.add_merged_rcall(merged),
        }
    }

    pub fn add_gauge(&mut self, sample: &GaugeSample) {
        let period = self.bucket_of(sample.timestamp);
        let Some(index) = self.locate(sample.timestamp) else {
            return;
        };

        match self.gauges[index].entry(LocalKey::new(sample.host, sample.sid)) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb_sample(sample),
            Entry::Vacant(entry) => {
                entry.insert(MergedGauge {
                    timestamp: period,
                    host: sample.host,
                    sid: sample.sid,
                    freq: self.freq,
                    kind: sample.kind,
                    value: sample.value,
                });
            }
        }
    }

    pub fn add_merged_gauge(&mut self, merged: &MergedGauge) {
        let period = self.bucket_of(merged.timestamp);
        let Some(index) = self.locate(merged.timestamp) else {
            return;
        };

        match self.gauges[index].entry(LocalKey::new(merged.host, merged.sid)) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(merged),
            Entry::Vacant(entry) => {
                entry.insert(MergedGauge {
                    timestamp: period,
                    freq: self.freq,
                    ..merged.clone()
                });
            }
        }
    }

    pub fn add_lcall(&mut self, sample: &CallSample) {
        let period = self.bucket_of(sample.timestamp);
        let Some(index) = self.locate(sample.timestamp) else {
            return;
        };

        match self.lcalls[index].entry(LocalKey::new(sample.host, sample.sid)) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().absorb_sample(sample.retcode, sample.result);
            }
            Entry::Vacant(entry) => {
                let mut rets = RetcodeMap::new();
                rets.insert(sample.retcode, MergedResult::first(sample.result));
                entry.insert(MergedLcall {
                    timestamp: period,
                    host: sample.host,
                    sid: sample.sid,
                    freq: self.freq,
                    rets,
                });
            }
        }
    }

    pub fn add_merged_lcall(&mut self, merged: &MergedLcall) {
        let period = self.bucket_of(merged.timestamp);
        let Some(index) = self.locate(merged.timestamp) else {
            return;
        };

        match self.lcalls[index].entry(LocalKey::new(merged.host, merged.sid)) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(merged),
            Entry::Vacant(entry) => {
                entry.insert(MergedLcall {
                    timestamp: period,
                    freq: self.freq,
                    ..merged.clone()
                });
            }
        }
    }

    pub fn add_rcall(&mut self, sample: &RemoteCallSample) {
        let period = self.bucket_of(sample.timestamp);
        let Some(index) = self.locate(sample.timestamp) else {
            return;
        };

        let key = RcallKey::new(
            LocalKey::new(sample.src_host, sample.src_sid),
            LocalKey::new(sample.dst_host, sample.dst_sid),
        );
        match self.rcalls[index].entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().absorb_sample(sample.retcode, sample.result);
            }
            Entry::Vacant(entry) => {
                let mut rets = RetcodeMap::new();
                rets.insert(sample.retcode, MergedResult::first(sample.result));
                entry.insert(MergedRcall {
                    timestamp: period,
                    src_host: sample.src_host,
                    src_sid: sample.src_sid,
                    dst_host: sample.dst_host,
                    dst_sid: sample.dst_sid,
                    freq: self.freq,
                    rets,
                });
            }
        }
    }

    pub fn add_merged_rcall(&mut self, merged: &MergedRcall) {
        let period = self.bucket_of(merged.timestamp);
        let Some(index) = self.locate(merged.timestamp) else {
            return;
        };

        match self.rcalls[index].entry(merged.key()) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(merged),
            Entry::Vacant(entry) => {
                entry.insert(MergedRcall {
                    timestamp: period,
                    freq: self.freq,
                    ..merged.clone()
                });
            }
        }
    }
}
