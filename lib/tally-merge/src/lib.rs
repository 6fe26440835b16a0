//! Time-bucketed aggregation for the tally pipeline: the agent-side
//! [`Merger`] ring that flushes overrun buckets to a sink, and the
//! query-side [`Combiner`] that re-aggregates stored records over a fixed
//! window.

#![deny(clippy::all)]

mod combiner;
mod merger;

pub use self::combiner::Combiner;
pub use self::merger::{GaugeMap, LcallMap, MergedSink, Merger, RcallMap, MIN_PERIODS};
