//! Per-prefix log tailer.
//!
//! Each watched prefix gets one OS thread running [`Tailer::run`]: find the
//! current log file, read whatever has been appended since the cursor,
//! decode whole frames into the merger, and persist the cursor just behind
//! any partial trailing frame. Rollover to the next daily file is only
//! considered after two consecutive empty passes (a writer may simply be
//! slow, and one quiet poll interval is not evidence that the day is over)
//! or after repeated I/O errors on the current file.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use tally_merge::{MergedSink, Merger};
use tally_protocol::{drain_frames, Frequency, FrequencyError};

use super::cursor::{CursorStore, CURSOR_SUFFIX};

/// Bytes read per syscall, contiguous to any unhandled partial frame.
pub const READ_CHUNK: usize = 8 * 1024;

/// Consecutive I/O failures tolerated before looking for the next file.
const IO_RETRIES: u32 = 5;

/// Consecutive empty passes required before rollover is considered.
const EOF_ROLLOVER: u32 = 2;

/// Immutable snapshot of the agent settings a tailer needs; handed over at
/// spawn so the tailer never reaches back into shared agent state.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub check_interval: Duration,
    pub merge_freq: Frequency,
    pub cached_periods: usize,
}

/// Outcome of a single open-seek-read-to-EOF pass over the current file.
enum Pass {
    /// At least one chunk was consumed before EOF.
    Progress,
    /// Nothing new.
    Eof,
    /// Open, seek or read failed.
    Error,
    Shutdown,
}

enum Watch {
    /// The cursor now points at the next file; locate it and go again.
    Rolled,
    Exit,
}

enum Wait {
    Continue,
    Shutdown,
}

pub struct Tailer<S: MergedSink> {
    config: TailerConfig,
    cursor: CursorStore,
    merger: Merger<S>,
    /// Unhandled partial-frame bytes followed by freshly read data.
    buf: BytesMut,
    shutdown: Receiver<()>,
}

impl<S: MergedSink> Tailer<S> {
    pub fn new(
        config: TailerConfig,
        sink: S,
        shutdown: Receiver<()>,
    ) -> Result<Tailer<S>, FrequencyError> {
        let cursor = CursorStore::new(&config.directory, &config.prefix);
        let merger = Merger::new(config.merge_freq, config.cached_periods, sink)?;

        Ok(Tailer {
            config,
            cursor,
            merger,
            buf: BytesMut::with_capacity(READ_CHUNK * 2),
            shutdown,
        })
    }

    /// Thread entry point; returns when the shutdown channel closes.
    pub fn run(mut self) {
        info!(message = "tailer started", prefix = %self.config.prefix);

        loop {
            if let Wait::Shutdown = self.wait() {
                break;
            }

            let Some((file, offset)) = self.position() else {
                // nothing to tail yet for this prefix
                continue;
            };

            match self.watch_file(file, offset) {
                Watch::Rolled => continue,
                Watch::Exit => break,
            }
        }

        // don't strand the last buckets in memory
        self.merger.flush();
        info!(message = "tailer exit", prefix = %self.config.prefix);
    }

    fn wait(&self) -> Wait {
        match self.shutdown.recv_timeout(self.config.check_interval) {
            Err(RecvTimeoutError::Timeout) => Wait::Continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Wait::Shutdown,
        }
    }

    fn stopping(&self) -> bool {
        !matches!(self.shutdown.try_recv(), Err(TryRecvError::Empty))
    }

    /// Where to resume: the cursor (in-memory cache first), else the
    /// earliest log file for the prefix, else nowhere.
    fn position(&mut self) -> Option<(String, u64)> {
        if let Some(position) = self.cursor.load() {
            return Some(position);
        }
        self.earliest_log().map(|file| (file, 0))
    }

    fn watch_file(&mut self, file: String, mut offset: u64) -> Watch {
        self.buf.clear();
        let mut eof_count = 0u32;
        let mut ioe_count = 0u32;

        loop {
            match self.read_pass(&file, &mut offset) {
                Pass::Progress => {
                    eof_count = 0;
                    ioe_count = 0;
                }
                Pass::Eof => {
                    eof_count += 1;
                    ioe_count = 0;
                    debug!(
                        message = "empty pass",
                        file = %file,
                        eof_count,
                        prefix = %self.config.prefix,
                    );
                    if eof_count >= EOF_ROLLOVER && self.roll_over(&file) {
                        return Watch::Rolled;
                    }
                }
                Pass::Error => {
                    ioe_count += 1;
                    eof_count = 0;
                    debug!(
                        message = "failed pass",
                        file = %file,
                        ioe_count,
                        prefix = %self.config.prefix,
                    );
                    if ioe_count >= IO_RETRIES && self.roll_over(&file) {
                        return Watch::Rolled;
                    }
                }
                Pass::Shutdown => return Watch::Exit,
            }

            if let Wait::Shutdown = self.wait() {
                let _ = self.cursor.save(&file, offset - self.buf.len() as u64);
                return Watch::Exit;
            }
        }
    }

    /// Open the file, seek to `offset`, and consume appended bytes until
    /// EOF. `offset` tracks everything read, including any trailing
    /// partial frame still sitting in `buf`; the persisted cursor is
    /// always `offset - buf.len()`.
    fn read_pass(&mut self, file: &str, offset: &mut u64) -> Pass {
        let path = self.config.directory.join(file);
        let mut handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(err) => {
                error!(
                    message = "failed to open log file",
                    path = %path.display(),
                    error = %err,
                );
                return Pass::Error;
            }
        };

        if let Err(err) = handle.seek(SeekFrom::Start(*offset)) {
            error!(
                message = "failed to seek log file",
                path = %path.display(),
                offset = *offset,
                error = %err,
            );
            return Pass::Error;
        }

        let mut consumed = 0usize;
        loop {
            if self.stopping() {
                let _ = self.cursor.save(file, *offset - self.buf.len() as u64);
                return Pass::Shutdown;
            }

            let rlen = match self.read_chunk(&mut handle) {
                Ok(rlen) => rlen,
                Err(err) => {
                    error!(
                        message = "read failed",
                        path = %path.display(),
                        consumed,
                        error = %err,
                    );
                    return Pass::Error;
                }
            };
            if rlen == 0 {
                return if consumed > 0 { Pass::Progress } else { Pass::Eof };
            }

            consumed += rlen;
            *offset += rlen as u64;

            let merger = &mut self.merger;
            match drain_frames(&mut self.buf, |record| merger.add(&record)) {
                Ok(decoded) => {
                    debug!(
                        message = "decoded frames",
                        file,
                        decoded,
                        unhandled = self.buf.len(),
                    );
                }
                Err(err) => {
                    // Whole frames before the bad bytes were already
                    // delivered; skip the rest of what we buffered and
                    // pick the stream back up from here.
                    warn!(
                        message = "corrupt frame, abandoning buffered bytes",
                        file,
                        abandoned = self.buf.len(),
                        error = %err,
                    );
                    self.buf.clear();
                }
            }

            let _ = self.cursor.save(file, *offset - self.buf.len() as u64);
        }
    }

    fn read_chunk(&mut self, handle: &mut File) -> io::Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);

        let mut attempts = 0;
        let result = loop {
            match handle.read(&mut self.buf[start..]) {
                Ok(n) => break Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted && attempts < IO_RETRIES => {
                    attempts += 1;
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                self.buf.truncate(start);
                Err(err)
            }
        }
    }

    /// Point the cursor at the lexicographically next log file, if one
    /// exists. Unhandled bytes belong to the file being left behind and
    /// are dropped with a warning.
    fn roll_over(&mut self, current: &str) -> bool {
        let Some(next) = self.next_log(current) else {
            debug!(
                message = "no newer log file, watching the current one again",
                file = current,
            );
            return false;
        };

        info!(
            message = "rolling over",
            from = current,
            to = %next,
            prefix = %self.config.prefix,
        );
        if !self.buf.is_empty() {
            warn!(
                message = "dropping unhandled bytes at rollover",
                file = current,
                bytes = self.buf.len(),
            );
            self.buf.clear();
        }

        if self.cursor.save(&next, 0).is_err() {
            // cached in memory by the store; keep going
            error!(message = "cursor write for rollover failed", next = %next);
        }
        true
    }

    fn scan_logs<F: FnMut(&str)>(&self, mut each: F) {
        let cursor_name = format!("{}{}", self.config.prefix, CURSOR_SUFFIX);

        let entries = match fs::read_dir(&self.config.directory) {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    message = "failed to scan log directory",
                    directory = %self.config.directory.display(),
                    error = %err,
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.config.prefix) || name == cursor_name {
                continue;
            }
            each(name);
        }
    }

    fn earliest_log(&self) -> Option<String> {
        let mut earliest: Option<String> = None;
        self.scan_logs(|name| {
            if earliest.as_deref().map_or(true, |e| name < e) {
                earliest = Some(name.to_owned());
            }
        });
        earliest
    }

    fn next_log(&self, current: &str) -> Option<String> {
        let mut next: Option<String> = None;
        self.scan_logs(|name| {
            if name > current && next.as_deref().map_or(true, |n| name < n) {
                next = Some(name.to_owned());
            }
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tally_merge::{GaugeMap, LcallMap, RcallMap};
    use tally_protocol::record::{GaugeKind, GaugeSample, Record};
    use tally_protocol::types::{HostAddr, StatId};
    use tally_protocol::{FreqUnit, Writer};

    #[derive(Default)]
    struct Collect {
        gauges: Vec<GaugeMap>,
    }

    impl MergedSink for Collect {
        fn save_gauges(&mut self, gauges: GaugeMap) {
            self.gauges.push(gauges);
        }
        fn save_lcalls(&mut self, _: LcallMap) {}
        fn save_rcalls(&mut self, _: RcallMap) {}
    }

    fn gauge_frame(ts: i64, value: i64) -> Vec<u8> {
        let record = Record::Gauge(GaugeSample {
            timestamp: ts,
            host: HostAddr::V4([127, 0, 0, 1]),
            sid: StatId::new(1, 2, 100),
            kind: GaugeKind::Snapshot,
            value,
        });
        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 1024);
        record.encode(&mut writer).unwrap();
        buf.to_vec()
    }

    fn tailer(dir: &std::path::Path) -> (Tailer<Collect>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let tailer = Tailer::new(
            TailerConfig {
                directory: dir.to_owned(),
                prefix: "svc".into(),
                check_interval: Duration::from_millis(10),
                merge_freq: Frequency::new(FreqUnit::Minute, 1),
                cached_periods: 2,
            },
            Collect::default(),
            rx,
        )
        .unwrap();
        (tailer, tx)
    }

    #[test]
    fn read_pass_decodes_and_persists_behind_partials() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = gauge_frame(60_000, 1);
        data.extend_from_slice(&gauge_frame(60_001, 2));
        let partial = &gauge_frame(60_002, 3)[..10];
        data.extend_from_slice(partial);
        fs::write(dir.path().join("svc_2021_06_01.bin"), &data).unwrap();

        let (mut tailer, _tx) = tailer(dir.path());
        let mut offset = 0;
        assert!(matches!(
            tailer.read_pass("svc_2021_06_01.bin", &mut offset),
            Pass::Progress
        ));

        assert_eq!(offset, data.len() as u64);
        assert_eq!(tailer.buf.len(), 10, "partial frame is retained");
        assert_eq!(
            tailer.cursor.load(),
            Some(("svc_2021_06_01.bin".to_owned(), 58))
        );
    }

    #[test]
    fn resuming_from_cursor_reads_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let data = gauge_frame(60_000, 1);
        fs::write(dir.path().join("svc_2021_06_01.bin"), &data).unwrap();

        let (mut tailer, _tx) = tailer(dir.path());
        let mut offset = 0;
        assert!(matches!(
            tailer.read_pass("svc_2021_06_01.bin", &mut offset),
            Pass::Progress
        ));

        // second pass from the persisted cursor: unchanged file, no frames
        let (file, mut offset) = tailer.position().unwrap();
        assert_eq!(offset, data.len() as u64);
        assert!(matches!(tailer.read_pass(&file, &mut offset), Pass::Eof));
    }

    #[test]
    fn corrupt_bytes_are_skipped_and_cursor_moves_past() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = gauge_frame(60_000, 1);
        data.extend_from_slice(&[0xee; 7]); // garbage tail
        fs::write(dir.path().join("svc_2021_06_01.bin"), &data).unwrap();

        let (mut tailer, _tx) = tailer(dir.path());
        let mut offset = 0;
        assert!(matches!(
            tailer.read_pass("svc_2021_06_01.bin", &mut offset),
            Pass::Progress
        ));

        assert!(tailer.buf.is_empty());
        assert_eq!(
            tailer.cursor.load(),
            Some(("svc_2021_06_01.bin".to_owned(), data.len() as u64))
        );
    }

    #[test]
    fn earliest_and_next_ignore_the_cursor_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "svc_2021_06_01.bin",
            "svc_2021_06_02.bin",
            "svc_cursor.pt",
            "other_2021_01_01.bin",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let (tailer, _tx) = tailer(dir.path());
        assert_eq!(tailer.earliest_log().as_deref(), Some("svc_2021_06_01.bin"));
        assert_eq!(
            tailer.next_log("svc_2021_06_01.bin").as_deref(),
            Some("svc_2021_06_02.bin")
        );
        assert_eq!(tailer.next_log("svc_2021_06_02.bin"), None);
    }

    #[test]
    fn roll_over_resets_unhandled_and_rewrites_cursor() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc_2021_06_01.bin"), b"").unwrap();
        fs::write(dir.path().join("svc_2021_06_02.bin"), b"").unwrap();

        let (mut tailer, _tx) = tailer(dir.path());
        tailer.buf.extend_from_slice(&[1, 2, 3]);

        assert!(tailer.roll_over("svc_2021_06_01.bin"));
        assert!(tailer.buf.is_empty());
        assert_eq!(
            tailer.cursor.load(),
            Some(("svc_2021_06_02.bin".to_owned(), 0))
        );

        // nothing newer than the last file
        assert!(!tailer.roll_over("svc_2021_06_02.bin"));
    }
}
