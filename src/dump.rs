//! `tally dump`: render the frames of log or storage files as text, one
//! record per line (merged call records spill their retcode rows onto
//! indented lines). Reads the same codec the pipeline uses, so whatever
//! the tailer would accept, this prints.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::BytesMut;
use chrono::{Local, TimeZone};

use tally_protocol::record::{MergedLcall, MergedRcall, Record};
use tally_protocol::{drain_frames, RetcodeMap};

const READ_CHUNK: usize = 16 * 1024;

/// Dump every file; returns false if any of them failed to open or
/// contained undecodable bytes.
pub fn dump_files(paths: &[std::path::PathBuf]) -> bool {
    let mut clean = true;
    for path in paths {
        if let Err(err) = dump_file(path) {
            eprintln!("{}: {err}", path.display());
            clean = false;
        }
    }
    clean
}

fn dump_file(path: &Path) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 2);

    loop {
        let filled = buf.len();
        buf.resize(filled + READ_CHUNK, 0);
        let rlen = match file.read(&mut buf[filled..]) {
            Ok(rlen) => rlen,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                buf.truncate(filled);
                continue;
            }
            Err(err) => return Err(err),
        };
        buf.truncate(filled + rlen);

        if rlen == 0 {
            if !buf.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} trailing byte(s) do not form a frame", buf.len()),
                ));
            }
            return Ok(());
        }

        drain_frames(&mut buf, print_record).map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
        })?;
    }
}

fn print_record(record: Record) {
    match &record {
        Record::Gauge(g) => println!(
            "IG\t{}\t{}\t{}\t{}\t{}",
            time(g.timestamp),
            g.host,
            g.sid,
            g.kind as u8,
            g.value
        ),
        Record::Lcall(c) => println!(
            "IL\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            time(c.timestamp),
            c.host,
            c.sid,
            c.retcode,
            c.result.rsp_time_us,
            c.result.in_bytes,
            c.result.out_bytes,
            c.key,
            c.extra
        ),
        Record::Rcall(c) => println!(
            "IR\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            time(c.timestamp),
            c.src_host,
            c.src_sid,
            c.dst_host,
            c.dst_sid,
            c.retcode,
            c.result.rsp_time_us,
            c.result.in_bytes,
            c.result.out_bytes,
            c.key,
            c.extra
        ),
        Record::MergedGauge(g) => println!(
            "MG\t{}\t{}\t{}\t{}\t{}\t{}",
            time(g.timestamp),
            g.host,
            g.sid,
            g.freq,
            g.kind as u8,
            g.value
        ),
        Record::MergedLcall(MergedLcall {
            timestamp,
            host,
            sid,
            freq,
            rets,
        }) => {
            println!("ML\t{}\t{host}\t{sid}\t{freq}", time(*timestamp));
            print_rets(rets);
        }
        Record::MergedRcall(MergedRcall {
            timestamp,
            src_host,
            src_sid,
            dst_host,
            dst_sid,
            freq,
            rets,
        }) => {
            println!(
                "MR\t{}\t{src_host}\t{src_sid}\t{dst_host}\t{dst_sid}\t{freq}",
                time(*timestamp)
            );
            print_rets(rets);
        }
    }
}

fn print_rets(rets: &RetcodeMap) {
    let mut retcodes: Vec<_> = rets.keys().copied().collect();
    retcodes.sort_unstable();
    for retcode in retcodes {
        let row = &rets[&retcode];
        println!(
            "\t{retcode}\t{}\t{}\t{}\t{}",
            row.count, row.rsp_time_us, row.in_bytes, row.out_bytes
        );
    }
}

fn time(timestamp: i64) -> String {
    match Local.timestamp_millis_opt(timestamp).single() {
        Some(date) => date.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("@{timestamp}"),
    }
}
