//! TOML configuration for both halves of the pipeline.
//!
//! One file can carry an `[agent]` table, a `[storage]` table, or both;
//! every field has a default so a minimal deployment only overrides the
//! directories and addresses it cares about.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use tally_protocol::{Frequency, FrequencyError};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("bad frequency in configuration: {source}"))]
    Frequency { source: FrequencyError },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&text).context(ParseSnafu { path })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Directory the client libraries write their daily logs into.
    pub stat_directory: PathBuf,

    /// How often the watch thread rescans for new prefixes and drives the
    /// host-info report, in seconds.
    pub watch_interval_secs: u64,

    /// How long a tailer sleeps between read passes, in seconds.
    pub stat_check_interval_secs: u64,

    /// Cadence of host-info reports to the meta flow, in seconds.
    pub report_host_info_interval_secs: u64,

    /// Bucket length used when merging, e.g. `"5m"`.
    pub merge_frequency: String,

    /// Ring length of each tailer's merger.
    pub cached_periods: usize,

    /// Storage flow address.
    pub storage_addr: String,

    /// Meta flow address; omit to disable host-info reporting.
    pub meta_addr: Option<String>,

    /// Address this host reports itself as; defaults to 0.0.0.0.
    pub local_address: Option<String>,

    /// Host name sent in host-info reports; defaults to the value of the
    /// HOSTNAME environment variable, else empty.
    pub host_name: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            stat_directory: PathBuf::from("./stats"),
            watch_interval_secs: 2,
            stat_check_interval_secs: 2,
            report_host_info_interval_secs: 3600,
            merge_frequency: "5m".into(),
            cached_periods: 2,
            storage_addr: "127.0.0.1:7090".into(),
            meta_addr: None,
            local_address: None,
            host_name: None,
        }
    }
}

impl AgentConfig {
    pub fn merge_freq(&self) -> Result<Frequency, ConfigError> {
        self.merge_frequency.parse().context(FrequencySnafu)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn stat_check_interval(&self) -> Duration {
        Duration::from_secs(self.stat_check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Root of the year/pid/mid partition tree.
    pub stats_dir: PathBuf,

    pub listen_addr: String,

    /// Bucket length the agents merge at; queries load files written at
    /// this grain.
    pub stored_frequency: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            stats_dir: PathBuf::from("./stats-store"),
            listen_addr: "127.0.0.1:7090".into(),
            stored_frequency: "1m".into(),
        }
    }
}

impl StorageConfig {
    pub fn stored_freq(&self) -> Result<Frequency, ConfigError> {
        self.stored_frequency.parse().context(FrequencySnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_protocol::FreqUnit;

    #[test]
    fn defaults_stand_alone() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.agent.watch_interval_secs, 2);
        assert_eq!(config.agent.cached_periods, 2);
        assert_eq!(
            config.agent.merge_freq().unwrap(),
            Frequency::new(FreqUnit::Minute, 5)
        );
        assert_eq!(config.storage.stored_frequency, "1m");
        assert!(config.agent.meta_addr.is_none());
    }

    #[test]
    fn tables_override_fields() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            stat_directory = "/var/lib/tally/stats"
            merge_frequency = "30s"
            meta_addr = "10.0.0.5:7091"

            [storage]
            listen_addr = "0.0.0.0:7090"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.agent.stat_directory,
            PathBuf::from("/var/lib/tally/stats")
        );
        assert_eq!(
            config.agent.merge_freq().unwrap(),
            Frequency::new(FreqUnit::Second, 30)
        );
        assert_eq!(config.agent.meta_addr.as_deref(), Some("10.0.0.5:7091"));
        assert_eq!(config.storage.listen_addr, "0.0.0.0:7090");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[agent]\nwatch = 5\n").is_err());
    }

    #[test]
    fn bad_frequency_surfaces_at_use() {
        let config: Config = toml::from_str("[agent]\nmerge_frequency = \"5x\"\n").unwrap();
        assert!(config.agent.merge_freq().is_err());
    }
}
