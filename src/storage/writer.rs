//! Appends merged records into the year/pid/mid partition tree.
//!
//! One file per (identity, frequency) per year, append-only; concurrent
//! appends to distinct identities never touch the same file, and frames
//! are far below the kernel's atomic-append threshold. A partial append
//! loses the frame and possibly poisons the file tail; readers skip
//! undecodable tails, so the damage stays local.

use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{Datelike, Local, TimeZone};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use tally_protocol::record::{MergedGauge, MergedLcall, MergedRcall, Record};
use tally_protocol::{EncodeError, Frequency, HostAddr, StatId, Writer};

/// File-name tags per merged record kind.
pub const TAG_GAUGE: &str = "MG";
pub const TAG_LCALL: &str = "ML";
pub const TAG_RCALL: &str = "MR";

/// A merged call record with a full retcode map stays under this.
const FRAME_CAP: usize = 8192;

const WRITE_RETRIES: u32 = 5;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("failed to encode merged record: {source}"))]
    Encode { source: EncodeError },

    #[snafu(display("failed to open {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to append to {}: {source}", path.display()))]
    Append { path: PathBuf, source: io::Error },

    #[snafu(display(
        "partial append to {}: wrote {written} of {expected} byte(s), file tail may be corrupt",
        path.display()
    ))]
    PartialAppend {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[snafu(display("timestamp {timestamp} has no calendar year"))]
    Time { timestamp: i64 },
}

/// Partition year for a record timestamp.
pub fn year_of(timestamp: i64) -> Result<i32, StoreError> {
    Local
        .timestamp_millis_opt(timestamp)
        .single()
        .map(|date| date.year())
        .ok_or(StoreError::Time { timestamp })
}

/// `<base>/<YYYY>/<pid>/<mid>/<TAG>_<pid>_<mid>_<iid>_<host>_<freq>.bin`
pub fn local_path(
    base: &Path,
    tag: &str,
    year: i32,
    sid: StatId,
    host: HostAddr,
    freq: Frequency,
) -> PathBuf {
    base.join(format!("{year:04}"))
        .join(format!("{:04x}", sid.pid))
        .join(format!("{:04x}", sid.mid))
        .join(format!(
            "{tag}_{:04x}_{:04x}_{:04x}_{host}_{freq}.bin",
            sid.pid, sid.mid, sid.iid
        ))
}

/// Remote-call files live under the caller's partition and name both ends.
pub fn rcall_path(
    base: &Path,
    year: i32,
    src_sid: StatId,
    src_host: HostAddr,
    dst_sid: StatId,
    dst_host: HostAddr,
    freq: Frequency,
) -> PathBuf {
    base.join(format!("{year:04}"))
        .join(format!("{:04x}", src_sid.pid))
        .join(format!("{:04x}", src_sid.mid))
        .join(format!(
            "{TAG_RCALL}_{:04x}_{:04x}_{:04x}_{src_host}_{:04x}_{:04x}_{:04x}_{dst_host}_{freq}.bin",
            src_sid.pid, src_sid.mid, src_sid.iid, dst_sid.pid, dst_sid.mid, dst_sid.iid
        ))
}

pub struct StoreWriter {
    base_dir: PathBuf,
}

impl StoreWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> StoreWriter {
        StoreWriter {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Route a merged record to its file. Item records have no place in
    /// the store and are rejected by the caller before this point.
    pub fn save(&self, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::MergedGauge(gauge) => self.save_gauge(gauge),
            Record::MergedLcall(lcall) => self.save_lcall(lcall),
            Record::MergedRcall(rcall) => self.save_rcall(rcall),
            Record::Gauge(_) | Record::Lcall(_) | Record::Rcall(_) => Ok(()),
        }
    }

    pub fn save_gauge(&self, gauge: &MergedGauge) -> Result<(), StoreError> {
        let year = year_of(gauge.timestamp)?;
        let path = local_path(
            &self.base_dir,
            TAG_GAUGE,
            year,
            gauge.sid,
            gauge.host,
            gauge.freq,
        );
        self.append(&path, &Record::MergedGauge(gauge.clone()))
    }

    pub fn save_lcall(&self, lcall: &MergedLcall) -> Result<(), StoreError> {
        let year = year_of(lcall.timestamp)?;
        let path = local_path(
            &self.base_dir,
            TAG_LCALL,
            year,
            lcall.sid,
            lcall.host,
            lcall.freq,
        );
        self.append(&path, &Record::MergedLcall(lcall.clone()))
    }

    pub fn save_rcall(&self, rcall: &MergedRcall) -> Result<(), StoreError> {
        let year = year_of(rcall.timestamp)?;
        let path = rcall_path(
            &self.base_dir,
            year,
            rcall.src_sid,
            rcall.src_host,
            rcall.dst_sid,
            rcall.dst_host,
            rcall.freq,
        );
        self.append(&path, &Record::MergedRcall(rcall.clone()))
    }

    fn append(&self, path: &Path, record: &Record) -> Result<(), StoreError> {
        let mut frame = BytesMut::with_capacity(256);
        let mut writer = Writer::new(&mut frame, FRAME_CAP);
        record.encode(&mut writer).context(EncodeSnafu)?;

        let mut file = match self.open_append(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // first record for this identity this year
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .context(OpenSnafu { path: path.to_owned() })?;
                    debug!(message = "created partition directory", path = %parent.display());
                }
                self.open_append(path)
                    .context(OpenSnafu { path: path.to_owned() })?
            }
            Err(source) => {
                return Err(StoreError::Open {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        let mut attempts = 0;
        loop {
            match file.write(&frame) {
                Ok(n) if n == frame.len() => return Ok(()),
                Ok(n) => {
                    warn!(
                        message = "partial append",
                        path = %path.display(),
                        written = n,
                        expected = frame.len(),
                    );
                    return PartialAppendSnafu {
                        path: path.to_owned(),
                        written: n,
                        expected: frame.len(),
                    }
                    .fail();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted && attempts < WRITE_RETRIES => {
                    attempts += 1;
                }
                Err(source) => {
                    return Err(StoreError::Append {
                        path: path.to_owned(),
                        source,
                    })
                }
            }
        }
    }

    fn open_append(&self, path: &Path) -> io::Result<std::fs::File> {
        OpenOptions::new().create(true).append(true).open(path)
    }
}
