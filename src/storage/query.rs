//! Serves `GET_SYSTEM_STATS`: expand the identity constraint against the
//! store, load the matching merged-gauge files over the query window,
//! re-bucket into the requested span, and roll the result up to the level
//! the caller asked for.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{Datelike, Local, TimeZone};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use tally_merge::Combiner;
use tally_protocol::iids::{self, MetricFamily};
use tally_protocol::wire::SystemStatsRequest;
use tally_protocol::{drain_frames, Frequency, FrequencyError, HostAddr, LocalKey, StatId};

use super::scanner::{scan, LocalKeyFilter};
use super::writer::{local_path, TAG_GAUGE};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Snafu)]
pub enum QueryError {
    #[snafu(display("query window [{start}, {end}) is empty"))]
    BadWindow { start: i64, end: i64 },

    #[snafu(display("unusable span: {source}"))]
    Span { source: FrequencyError },

    #[snafu(display("store scan failed: {source}"))]
    Scan { source: io::Error },
}

pub fn system_stats(
    base: &Path,
    stored_freq: Frequency,
    req: &SystemStatsRequest,
) -> Result<Combiner, QueryError> {
    let span = req.span.span_millis().context(SpanSnafu)?;
    if req.end <= req.start {
        return BadWindowSnafu {
            start: req.start,
            end: req.end,
        }
        .fail();
    }
    let merge_count = ((req.end - req.start) / span).max(1) as usize;

    // `QueryContext::Business` would translate product/module ids through
    // the business→resource table here; that table lives outside this
    // store, so both contexts currently read the same partitions.

    let hosts: Option<HashSet<HostAddr>> =
        (!req.hosts.is_empty()).then(|| req.hosts.iter().copied().collect());
    let mut filter = LocalKeyFilter::new(req.pid, req.mid, hosts.as_ref());
    scan(base, &mut filter).context(ScanSnafu)?;

    let select = FamilySelect::from_iids(&req.iids);

    let mut loaded = Combiner::new(req.span, req.start, merge_count).context(SpanSnafu)?;
    for key in &filter.keys {
        if !select.wants(key.sid.iid) {
            continue;
        }
        load_key(base, *key, stored_freq, req.start, req.end, &mut loaded);
    }

    let mut response = Combiner::new(req.span, req.start, merge_count).context(SpanSnafu)?;
    if req.pid == 0 {
        // department / product level: collapse everything
        loaded.fold_into(&mut response, |key| {
            LocalKey::new(HostAddr::ANY, StatId::new(0, 0, key.sid.iid))
        });
    } else if req.mid == 0 || req.total_view {
        // module roll-up under one product
        loaded.fold_into(&mut response, |key| {
            LocalKey::new(HostAddr::ANY, StatId::new(key.sid.pid, 0, key.sid.iid))
        });
    } else {
        // one module, expanded per host
        loaded.fold_into(&mut response, |key| {
            LocalKey::new(key.host, StatId::new(0, 0, key.sid.iid))
        });
    }

    Ok(response)
}

/// Which of the reserved-range series a request's iids select. Memory and
/// load-average are all-or-nothing families; CPU, network and disk select
/// by device number with `ALL`/`TOTAL`/`CORES` pseudo-numbers.
#[derive(Debug, Default)]
struct FamilySelect {
    cpu_total: bool,
    cpu_cores: bool,
    cpu_nos: HashSet<u16>,
    memory: bool,
    load_avg: bool,
    net_all: bool,
    net_nos: HashSet<u16>,
    disk_all: bool,
    disk_nos: HashSet<u16>,
}

impl FamilySelect {
    fn from_iids(requested: &[u16]) -> FamilySelect {
        let mut select = FamilySelect::default();
        for &iid in requested {
            match MetricFamily::of(iid) {
                Some(MetricFamily::Cpu) => match iids::cpu_no(iid) {
                    iids::CPU_NO_TOTAL => select.cpu_total = true,
                    iids::CPU_NO_CORES => select.cpu_cores = true,
                    no => {
                        select.cpu_nos.insert(no);
                    }
                },
                Some(MetricFamily::Memory) => select.memory = true,
                Some(MetricFamily::LoadAvg) => select.load_avg = true,
                Some(MetricFamily::Network) => match iids::net_no(iid) {
                    iids::NET_NO_ALL => select.net_all = true,
                    no => {
                        select.net_nos.insert(no);
                    }
                },
                Some(MetricFamily::Disk) => match iids::disk_no(iid) {
                    iids::DISK_NO_ALL => select.disk_all = true,
                    no => {
                        select.disk_nos.insert(no);
                    }
                },
                None => debug!(message = "ignoring unreserved iid in query", iid),
            }
        }
        select
    }

    fn wants(&self, iid: u16) -> bool {
        match MetricFamily::of(iid) {
            Some(MetricFamily::Cpu) => {
                let no = iids::cpu_no(iid);
                (self.cpu_total && no == iids::CPU_NO_TOTAL)
                    || (self.cpu_cores && no != iids::CPU_NO_TOTAL)
                    || self.cpu_nos.contains(&no)
            }
            Some(MetricFamily::Memory) => self.memory,
            Some(MetricFamily::LoadAvg) => self.load_avg,
            Some(MetricFamily::Network) => self.net_all || self.net_nos.contains(&iids::net_no(iid)),
            Some(MetricFamily::Disk) => self.disk_all || self.disk_nos.contains(&iids::disk_no(iid)),
            None => false,
        }
    }
}

/// Load one identity's gauge files across every year the window touches.
fn load_key(
    base: &Path,
    key: LocalKey,
    stored_freq: Frequency,
    start: i64,
    end: i64,
    loaded: &mut Combiner,
) {
    for year in years_of_window(start, end) {
        let path = local_path(base, TAG_GAUGE, year, key.sid, key.host, stored_freq);
        match load_file(&path, start, end, loaded) {
            Ok(records) => {
                if records > 0 {
                    debug!(message = "loaded stats file", path = %path.display(), records);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // nothing recorded for this identity that year
            }
            Err(err) => {
                warn!(
                    message = "failed to load stats file",
                    path = %path.display(),
                    error = %err,
                );
            }
        }
    }
}

fn years_of_window(start: i64, end: i64) -> std::ops::RangeInclusive<i32> {
    let year = |ts: i64| {
        Local
            .timestamp_millis_opt(ts)
            .single()
            .map(|date| date.year())
            .unwrap_or(1970)
    };
    let first = year(start);
    let last = year(end - 1).max(first);
    first..=last
}

/// Stream one file through the codec, feeding in-window records to the
/// combiner. Corrupt content abandons the rest of the file; whatever
/// decoded before it stands.
fn load_file(path: &PathBuf, start: i64, end: i64, loaded: &mut Combiner) -> io::Result<usize> {
    let mut file = File::open(path)?;
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 2);
    let mut total = 0usize;

    loop {
        let filled = buf.len();
        buf.resize(filled + READ_CHUNK, 0);
        let rlen = match file.read(&mut buf[filled..]) {
            Ok(rlen) => rlen,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                buf.truncate(filled);
                continue;
            }
            Err(err) => return Err(err),
        };
        buf.truncate(filled + rlen);

        if rlen == 0 {
            if !buf.is_empty() {
                warn!(
                    message = "stats file ends mid-frame",
                    path = %path.display(),
                    dangling = buf.len(),
                );
            }
            return Ok(total);
        }

        let drained = drain_frames(&mut buf, |record| {
            let ts = record.timestamp();
            if ts >= start && ts < end {
                loaded.add_record(&record);
                total += 1;
            }
        });
        if let Err(err) = drained {
            warn!(
                message = "corrupt stats file, abandoning the rest",
                path = %path.display(),
                error = %err,
            );
            return Ok(total);
        }
    }
}
