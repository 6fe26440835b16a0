//! The agent orchestrator.
//!
//! One watch loop discovers prefixes (via their `*_cursor.pt` sentinels)
//! under the stat directory and spawns a tailer thread per prefix; the
//! same loop drives periodic host-info reports to the meta flow. Tailers
//! share nothing with each other or with the watch loop; each owns its
//! merger, buffers, cursor and storage connection, and is told to stop by
//! its shutdown channel closing.

pub mod cursor;
pub mod shipper;
pub mod tailer;

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{error, info, warn};

use tally_protocol::wire::cmd;
use tally_protocol::{Frequency, HostAddr, Reader, Writer};

use crate::config::{AgentConfig, ConfigError};
use crate::net::Flow;

use self::cursor::CURSOR_SUFFIX;
use self::shipper::BatchShipper;
use self::tailer::{Tailer, TailerConfig};

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

struct TailerHandle {
    prefix: String,
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

pub struct Agent {
    config: AgentConfig,
    freq: Frequency,
    tailers: Vec<TailerHandle>,
    meta: Option<Flow>,
    first_report_acked: bool,
    last_report: Option<Instant>,
}

/// Run until `shutdown` fires or closes.
pub fn run(config: AgentConfig, shutdown: Receiver<()>) -> Result<(), ConfigError> {
    let mut agent = Agent::new(config)?;
    info!(
        message = "agent started",
        directory = %agent.config.stat_directory.display(),
        merge_frequency = %agent.freq,
        storage = %agent.config.storage_addr,
    );

    agent.report_host_info();
    loop {
        agent.check_directory();
        agent.maybe_report_host_info();

        match shutdown.recv_timeout(agent.config.watch_interval()) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    agent.stop();
    Ok(())
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Agent, ConfigError> {
        let freq = config.merge_freq()?;
        let meta = config
            .meta_addr
            .clone()
            .map(|addr| Flow::new("meta", addr));

        Ok(Agent {
            config,
            freq,
            tailers: Vec::new(),
            meta,
            first_report_acked: false,
            last_report: None,
        })
    }

    pub fn watched(&self) -> usize {
        self.tailers.len()
    }

    /// Scan for `*_cursor.pt` sentinels and spawn a tailer for any prefix
    /// not already watched.
    pub fn check_directory(&mut self) {
        let pattern = self.config.stat_directory.join(format!("*{CURSOR_SUFFIX}"));
        let Some(pattern) = pattern.to_str() else {
            error!(message = "stat directory is not valid UTF-8");
            return;
        };

        let paths = match glob::glob(pattern) {
            Ok(paths) => paths,
            Err(err) => {
                error!(message = "bad sentinel pattern", pattern, error = %err);
                return;
            }
        };

        for path in paths.flatten() {
            let Some(prefix) = sentinel_prefix(&path) else {
                continue;
            };
            if self.tailers.iter().any(|t| t.prefix == prefix) {
                continue;
            }
            self.spawn_tailer(prefix);
        }
    }

    fn spawn_tailer(&mut self, prefix: String) {
        let config = TailerConfig {
            directory: self.config.stat_directory.clone(),
            prefix: prefix.clone(),
            check_interval: self.config.stat_check_interval(),
            merge_freq: self.freq,
            cached_periods: self.config.cached_periods,
        };
        let sink = BatchShipper::new(Flow::new("storage", self.config.storage_addr.clone()));

        let (tx, rx) = std::sync::mpsc::channel();
        let tailer = match Tailer::new(config, sink, rx) {
            Ok(tailer) => tailer,
            Err(err) => {
                error!(message = "cannot create tailer", prefix = %prefix, error = %err);
                return;
            }
        };

        let spawned = thread::Builder::new()
            .name(format!("tail-{prefix}"))
            .spawn(move || tailer.run());
        match spawned {
            Ok(join) => {
                info!(message = "watching new prefix", prefix = %prefix);
                self.tailers.push(TailerHandle {
                    prefix,
                    shutdown: tx,
                    join,
                });
            }
            Err(err) => {
                error!(message = "failed to spawn tailer thread", prefix = %prefix, error = %err)
            }
        }
    }

    /// Reporting backs off to a shorter gap until the meta side has
    /// acknowledged us once.
    fn report_gap(&self) -> Duration {
        let interval = self.config.report_host_info_interval_secs;
        let gap = if self.first_report_acked {
            interval
        } else {
            (interval / 3).clamp(60, 600).min(interval)
        };
        Duration::from_secs(gap.max(1))
    }

    fn maybe_report_host_info(&mut self) {
        if self.meta.is_none() {
            return;
        }
        let due = match self.last_report {
            None => true,
            Some(at) => at.elapsed() >= self.report_gap(),
        };
        if due {
            self.report_host_info();
        }
    }

    fn report_host_info(&mut self) {
        let Some(flow) = self.meta.as_mut() else {
            return;
        };

        let host = self
            .config
            .local_address
            .as_deref()
            .and_then(|addr| addr.parse::<HostAddr>().ok())
            .unwrap_or(HostAddr::ANY);
        let name = self
            .config
            .host_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_default();

        let mut body = BytesMut::new();
        let mut writer = Writer::new(&mut body, 1024);
        if writer.put_string(&name, 255).is_err() || host.encode(&mut writer).is_err() {
            error!(message = "failed to encode host info");
            return;
        }

        self.last_report = Some(Instant::now());
        match flow.request(cmd::REPORT_HOSTINFO_REQ, &body, ACK_TIMEOUT) {
            Ok((header, rsp)) if header.cmd == cmd::REPORT_HOSTINFO_RSP => {
                let status = Reader::new(&rsp).get_i32().unwrap_or(-1);
                info!(message = "host info reported", status);
                self.first_report_acked = true;
            }
            Ok((header, _)) => {
                warn!(message = "unexpected reply to host info", cmd = header.cmd);
            }
            Err(err) => {
                warn!(message = "host info report failed", error = %err);
            }
        }
    }

    /// Close every tailer's shutdown channel, then wait for them.
    pub fn stop(self) {
        info!(message = "agent stopping", tailers = self.tailers.len());

        let mut joins = Vec::with_capacity(self.tailers.len());
        for TailerHandle {
            prefix,
            shutdown,
            join,
        } in self.tailers
        {
            drop(shutdown);
            joins.push((prefix, join));
        }

        for (prefix, join) in joins {
            if join.join().is_err() {
                error!(message = "tailer thread panicked", prefix = %prefix);
            }
        }
    }
}

/// `svc_cursor.pt` → `svc`.
fn sentinel_prefix(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let prefix = name.strip_suffix(CURSOR_SUFFIX)?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_config(dir: &Path) -> AgentConfig {
        AgentConfig {
            stat_directory: dir.to_owned(),
            watch_interval_secs: 1,
            stat_check_interval_secs: 1,
            merge_frequency: "1m".into(),
            // nothing listens here; sends fail and are dropped, which is fine
            storage_addr: "127.0.0.1:1".into(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn sentinel_names_map_to_prefixes() {
        assert_eq!(
            sentinel_prefix(Path::new("/x/svc_cursor.pt")).as_deref(),
            Some("svc")
        );
        assert_eq!(sentinel_prefix(Path::new("/x/_cursor.pt")), None);
        assert_eq!(sentinel_prefix(Path::new("/x/svc.bin")), None);
    }

    #[test]
    fn check_directory_spawns_once_per_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc_cursor.pt"), "").unwrap();
        fs::write(dir.path().join("web_cursor.pt"), "").unwrap();
        fs::write(dir.path().join("svc_2021_06_01.bin"), "").unwrap();

        let mut agent = Agent::new(test_config(dir.path())).unwrap();
        agent.check_directory();
        assert_eq!(agent.watched(), 2);

        // rescans are idempotent; a new sentinel adds exactly one tailer
        agent.check_directory();
        assert_eq!(agent.watched(), 2);
        fs::write(dir.path().join("db_cursor.pt"), "").unwrap();
        agent.check_directory();
        assert_eq!(agent.watched(), 3);

        agent.stop();
    }

    #[test]
    fn report_gap_backs_off_until_first_ack() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::new(test_config(dir.path())).unwrap();

        // 3600 / 3 = 1200, clamped into [60, 600]
        assert_eq!(agent.report_gap(), Duration::from_secs(600));
        agent.first_report_acked = true;
        assert_eq!(agent.report_gap(), Duration::from_secs(3600));
    }
}
