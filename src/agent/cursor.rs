//! Durable read position for one log prefix.
//!
//! The cursor file holds a single line, `"<filename> <offset>"`, naming the
//! log file currently being tailed (basename only) and the byte offset of
//! the next unread record. It is rewritten in place on every advance; if
//! that write fails, the pair is kept in memory and takes precedence over
//! whatever stale value is on disk until a later write succeeds.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub const CURSOR_SUFFIX: &str = "_cursor.pt";

#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    cached: Option<(String, u64)>,
}

impl CursorStore {
    pub fn new(directory: &Path, prefix: &str) -> CursorStore {
        CursorStore {
            path: directory.join(format!("{prefix}{CURSOR_SUFFIX}")),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The position to resume from, or `None` when it is unknown (no
    /// cursor yet, empty sentinel, or unreadable content) and the caller
    /// should fall back to the earliest log file.
    pub fn load(&self) -> Option<(String, u64)> {
        if let Some(cached) = &self.cached {
            return Some(cached.clone());
        }

        let text = fs::read_to_string(&self.path).ok()?;
        let mut parts = text.split_whitespace();
        let file = parts.next()?.to_owned();
        let offset = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        debug!(
            message = "loaded cursor",
            path = %self.path.display(),
            file = %file,
            offset,
        );
        Some((file, offset))
    }

    /// Truncate-and-write the new position. On failure the pair is cached
    /// so the tailer resumes from the in-memory state rather than an
    /// earlier on-disk value.
    pub fn save(&mut self, file: &str, offset: u64) -> io::Result<()> {
        match fs::write(&self.path, format!("{file} {offset}")) {
            Ok(()) => {
                self.cached = None;
                Ok(())
            }
            Err(err) => {
                warn!(
                    message = "cursor write failed, caching position in memory",
                    path = %self.path.display(),
                    file,
                    offset,
                    error = %err,
                );
                self.cached = Some((file.to_owned(), offset));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sentinel_means_unknown() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc_cursor.pt"), "").unwrap();

        let cursor = CursorStore::new(dir.path(), "svc");
        assert_eq!(cursor.load(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = CursorStore::new(dir.path(), "svc");

        cursor.save("svc_2021_06_01.bin", 1234).unwrap();
        assert_eq!(
            cursor.load(),
            Some(("svc_2021_06_01.bin".to_owned(), 1234))
        );

        // a rewrite fully replaces the previous content
        cursor.save("svc_2021_06_02.bin", 0).unwrap();
        assert_eq!(cursor.load(), Some(("svc_2021_06_02.bin".to_owned(), 0)));
        let on_disk = fs::read_to_string(cursor.path()).unwrap();
        assert_eq!(on_disk, "svc_2021_06_02.bin 0");
    }

    #[test]
    fn missing_offset_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc_cursor.pt"), "svc_2021_06_01.bin").unwrap();

        let cursor = CursorStore::new(dir.path(), "svc");
        assert_eq!(cursor.load(), Some(("svc_2021_06_01.bin".to_owned(), 0)));
    }

    #[test]
    fn failed_save_is_served_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = CursorStore::new(dir.path(), "svc");
        cursor.save("svc_2021_06_01.bin", 10).unwrap();

        // point the store at an unwritable path to force the failure
        cursor.path = dir.path().join("no-such-dir").join("svc_cursor.pt");
        assert!(cursor.save("svc_2021_06_01.bin", 99).is_err());
        assert_eq!(
            cursor.load(),
            Some(("svc_2021_06_01.bin".to_owned(), 99)),
            "memory wins over the stale file"
        );
    }
}
