//! Record and message codecs for the tally pipeline.
//!
//! This crate holds everything both ends of the pipe must agree on: series
//! identities, bucket frequencies, the binary record formats written by
//! clients and shipped to storage, the metric-id registry, and the message
//! envelope used between agent and storage.

#![deny(clippy::all)]

pub mod buf;
pub mod freq;
pub mod iids;
pub mod record;
pub mod types;
pub mod wire;

pub use self::buf::{DecodeError, EncodeError, Reader, Writer};
pub use self::freq::{Frequency, FrequencyError, FreqUnit};
pub use self::record::{
    drain_frames, CallSample, GaugeKind, GaugeSample, MergedGauge, MergedLcall, MergedRcall,
    Record, RecordKind, RemoteCallSample, RetcodeMap, EXTRA_MAX, KEY_MAX,
};
pub use self::types::{CallResult, HostAddr, LocalKey, MergedResult, RcallKey, StatId};
