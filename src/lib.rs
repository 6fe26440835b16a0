//! tally: a call-stats telemetry pipeline.
//!
//! Applications emit gauges and call records through `tally-client` into
//! daily binary log files. The agent half of this crate tails those files,
//! aggregates them into time buckets, and ships merged buckets to the
//! storage half, which persists them in a year/pid/mid partition tree and
//! answers re-aggregating queries over it.

#![deny(clippy::all)]

pub mod agent;
pub mod config;
pub mod dump;
pub mod net;
pub mod storage;
