//! The emit side of the tally pipeline.
//!
//! Applications hold a [`StatsLogger`] and call `log_*` as work happens;
//! each call appends one encoded frame to the current day's log file under
//! the configured prefix. The agent discovers the prefix through the
//! `<prefix>_cursor.pt` sentinel this crate creates at construction and
//! tails the daily files from there.
//!
//! Appends are fire-and-forget from the application's point of view: an
//! error means this one record was lost (or, for a partial write, that the
//! tail of the file is garbage the tailer will skip), never that earlier
//! records were damaged.

#![deny(clippy::all)]

use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{Datelike, Local, TimeZone};
use snafu::{ResultExt, Snafu};

use tally_protocol::record::{CallSample, GaugeKind, GaugeSample, Record, RemoteCallSample};
use tally_protocol::{CallResult, EncodeError, HostAddr, StatId, Writer};

/// Suffix of the sentinel file announcing a prefix to the agent.
pub const CURSOR_SUFFIX: &str = "_cursor.pt";

/// A frame comfortably exceeds the largest record (an rcall with full-cap
/// key and extra strings).
const FRAME_MAX: usize = 1024;

const WRITE_RETRIES: u32 = 5;

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("failed to create sentinel {}: {source}", path.display()))]
    Sentinel { path: PathBuf, source: io::Error },

    #[snafu(display("failed to open log file {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to append to {}: {source}", path.display()))]
    Append { path: PathBuf, source: io::Error },

    /// The record is torn across the end of the file; readers will drop
    /// the fragment, but this record is gone.
    #[snafu(display(
        "partial append to {}: wrote {written} of {expected} byte(s)",
        path.display()
    ))]
    PartialAppend {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[snafu(display("failed to encode record: {source}"))]
    Encode { source: EncodeError },

    #[snafu(display("timestamp {timestamp} is not representable as a date"))]
    BadTimestamp { timestamp: i64 },
}

/// Per-process emit handle. Cheap to clone-free share behind a reference;
/// holds no open file, so concurrent loggers in one process only contend
/// on the kernel's append path.
#[derive(Debug)]
pub struct StatsLogger {
    pid: u16,
    mid: u16,
    host: HostAddr,
    prefix: PathBuf,
}

impl StatsLogger {
    /// Create a logger for `(pid, mid)` emitting under `prefix` (a path
    /// plus file-name stem, e.g. `/var/stats/svc`). Creates the cursor
    /// sentinel so an agent starts watching the prefix even before the
    /// first record is written.
    pub fn new(
        pid: u16,
        mid: u16,
        host: HostAddr,
        prefix: impl Into<PathBuf>,
    ) -> Result<StatsLogger, ClientError> {
        let prefix = prefix.into();

        let sentinel = sentinel_path(&prefix);
        match OpenOptions::new().create_new(true).write(true).open(&sentinel) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(ClientError::Sentinel { path: sentinel, source }),
        }

        Ok(StatsLogger {
            pid,
            mid,
            host,
            prefix,
        })
    }

    pub fn host(&self) -> HostAddr {
        self.host
    }

    fn sid(&self, iid: u16) -> StatId {
        StatId::new(self.pid, self.mid, iid)
    }

    pub fn log_gauge(&self, iid: u16, kind: GaugeKind, value: i64) -> Result<(), ClientError> {
        self.log_gauge_at(now_millis(), iid, kind, value)
    }

    pub fn log_gauge_at(
        &self,
        timestamp: i64,
        iid: u16,
        kind: GaugeKind,
        value: i64,
    ) -> Result<(), ClientError> {
        self.append(
            timestamp,
            &Record::Gauge(GaugeSample {
                timestamp,
                host: self.host,
                sid: self.sid(iid),
                kind,
                value,
            }),
        )
    }

    pub fn log_lcall(
        &self,
        iid: u16,
        retcode: i32,
        result: CallResult,
        key: &str,
        extra: &str,
    ) -> Result<(), ClientError> {
        self.log_lcall_at(now_millis(), iid, retcode, result, key, extra)
    }

    pub fn log_lcall_at(
        &self,
        timestamp: i64,
        iid: u16,
        retcode: i32,
        result: CallResult,
        key: &str,
        extra: &str,
    ) -> Result<(), ClientError> {
        self.append(
            timestamp,
            &Record::Lcall(CallSample {
                timestamp,
                host: self.host,
                sid: self.sid(iid),
                retcode,
                result,
                key: key.to_owned(),
                extra: extra.to_owned(),
            }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_rcall(
        &self,
        iid: u16,
        dst_host: HostAddr,
        dst_sid: StatId,
        retcode: i32,
        result: CallResult,
        key: &str,
        extra: &str,
    ) -> Result<(), ClientError> {
        self.log_rcall_at(now_millis(), iid, dst_host, dst_sid, retcode, result, key, extra)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_rcall_at(
        &self,
        timestamp: i64,
        iid: u16,
        dst_host: HostAddr,
        dst_sid: StatId,
        retcode: i32,
        result: CallResult,
        key: &str,
        extra: &str,
    ) -> Result<(), ClientError> {
        self.append(
            timestamp,
            &Record::Rcall(RemoteCallSample {
                timestamp,
                src_host: self.host,
                src_sid: self.sid(iid),
                dst_host,
                dst_sid,
                retcode,
                result,
                key: key.to_owned(),
                extra: extra.to_owned(),
            }),
        )
    }

    /// The daily file a record with this timestamp goes to.
    pub fn log_path(&self, timestamp: i64) -> Result<PathBuf, ClientError> {
        let date = Local
            .timestamp_millis_opt(timestamp)
            .single()
            .ok_or(ClientError::BadTimestamp { timestamp })?;

        let mut name = self
            .prefix
            .file_name()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(&format!(
            "_{:04}_{:02}_{:02}.bin",
            date.year(),
            date.month(),
            date.day()
        ));

        Ok(self.prefix.with_file_name(name))
    }

    fn append(&self, timestamp: i64, record: &Record) -> Result<(), ClientError> {
        let mut buf = BytesMut::with_capacity(FRAME_MAX);
        let mut writer = Writer::new(&mut buf, FRAME_MAX);
        record.encode(&mut writer).context(EncodeSnafu)?;

        let path = self.log_path(timestamp)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(OpenSnafu { path: path.clone() })?;

        let mut attempts = 0;
        loop {
            match file.write(&buf) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    return PartialAppendSnafu {
                        path,
                        written: n,
                        expected: buf.len(),
                    }
                    .fail()
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted && attempts < WRITE_RETRIES => {
                    attempts += 1;
                }
                Err(source) => return Err(ClientError::Append { path, source }),
            }
        }
    }
}

/// `<prefix>_cursor.pt` for a prefix path.
pub fn sentinel_path(prefix: &Path) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(CURSOR_SUFFIX);
    prefix.with_file_name(name)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_protocol::{drain_frames, GaugeKind};

    // tests resolve paths through log_path, so the host timezone never
    // changes which file they look at
    const TS: i64 = 1_622_548_800_000; // 2021-06-01 12:00:00 UTC

    fn logger(dir: &Path) -> StatsLogger {
        StatsLogger::new(
            1,
            2,
            HostAddr::V4([127, 0, 0, 1]),
            dir.join("svc"),
        )
        .unwrap()
    }

    #[test]
    fn init_creates_the_sentinel_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = logger(dir.path());
        assert!(dir.path().join("svc_cursor.pt").exists());

        // a second process with the same prefix must not fail
        drop(first);
        logger(dir.path());
    }

    #[test]
    fn gauge_appends_exactly_29_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        logger.log_gauge_at(TS, 100, GaugeKind::Delta, 100).unwrap();

        let path = logger.log_path(TS).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 29);

        logger.log_gauge_at(TS + 1, 100, GaugeKind::Delta, 7).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 58);
    }

    #[test]
    fn lcall_with_short_strings_appends_48_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        logger
            .log_lcall_at(TS, 200, 0, CallResult::new(100, 23, 1024), "key", "extra")
            .unwrap();

        let path = logger.log_path(TS).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);
    }

    #[test]
    fn frames_decode_back_to_what_was_logged() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        logger.log_gauge_at(TS, 100, GaugeKind::Snapshot, -3).unwrap();
        logger
            .log_rcall_at(
                TS + 5,
                300,
                HostAddr::V4([10, 0, 0, 9]),
                StatId::new(7, 7, 7),
                -2,
                CallResult::new(1, 2, 3),
                "",
                "",
            )
            .unwrap();

        let bytes = std::fs::read(logger.log_path(TS).unwrap()).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let mut records = Vec::new();
        drain_frames(&mut buf, |r| records.push(r)).unwrap();

        assert_eq!(records.len(), 2);
        match &records[0] {
            Record::Gauge(g) => {
                assert_eq!(g.sid, StatId::new(1, 2, 100));
                assert_eq!(g.value, -3);
            }
            other => panic!("expected a gauge, got {other:?}"),
        }
        match &records[1] {
            Record::Rcall(r) => assert_eq!(r.dst_sid, StatId::new(7, 7, 7)),
            other => panic!("expected an rcall, got {other:?}"),
        }
    }
}
