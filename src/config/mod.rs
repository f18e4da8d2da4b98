//! Sync engine configuration.
//!
//! A [`SyncConfig`] is built once, validated, and shared read-only by every
//! component. It can come from defaults, a TOML file, CLI flags or their
//! environment variables ([`SyncOpts`]), in increasing order of precedence.

pub mod duration;

use anyhow::Context;
use clap::{Args, ValueEnum};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use duration::parse_duration;

/// Which way records flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Batch sync into the relational store only
    ContentToRelational,
    /// Real-time mirroring into the content store only
    RelationalToContent,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    /// Whether the periodic batch path runs.
    pub fn writes_relational(&self) -> bool {
        matches!(self, Self::ContentToRelational | Self::Bidirectional)
    }

    /// Whether the real-time path runs.
    pub fn writes_content(&self) -> bool {
        matches!(self, Self::RelationalToContent | Self::Bidirectional)
    }
}

/// Policy applied when the target already holds a version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    ContentWins,
    RelationalWins,
    #[default]
    LastWriteWins,
    /// Leave records whose copies differ untouched. Conflicts found by a
    /// collection pass are kept in the collection's watermark until a later
    /// pass writes the record; conflicts on real-time changes are only
    /// logged.
    Manual,
}

/// Immutable configuration of a sync engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub enabled_collections: Vec<String>,
    pub sync_direction: SyncDirection,
    pub conflict_resolution: ConflictResolution,
    /// Maximum records read per collection pass
    pub batch_size: usize,
    /// Period of the full sync timer; zero disables the timer
    #[serde(deserialize_with = "duration::deserialize")]
    pub sync_interval: Duration,
    /// Total attempts a queued job gets before it is dropped
    pub max_retry_attempts: u32,
    pub realtime_enabled: bool,
    /// Bound on every individual store call
    #[serde(deserialize_with = "duration::deserialize")]
    pub store_timeout: Duration,
    /// Base of the exponential retry backoff
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_base_delay: Duration,
    /// How often change feeds poll for new events
    #[serde(deserialize_with = "duration::deserialize")]
    pub realtime_poll_interval: Duration,
}

pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "users",
    "tenants",
    "customers",
    "services",
    "stylists",
    "appointments",
    "products",
    "locations",
    "pages",
    "commissions",
    "inventory",
    "service-packages",
    "wait-list",
    "documentation",
    "notifications",
];

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled_collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            sync_direction: SyncDirection::default(),
            conflict_resolution: ConflictResolution::default(),
            batch_size: 100,
            sync_interval: Duration::from_secs(5 * 60),
            max_retry_attempts: 3,
            realtime_enabled: true,
            store_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(1),
            realtime_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse sync configuration")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn is_enabled(&self, collection: &str) -> bool {
        self.enabled_collections.iter().any(|c| c == collection)
    }

    /// Whether the real-time listener should be started.
    pub fn realtime_active(&self) -> bool {
        self.realtime_enabled && self.sync_direction.writes_content()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled_collections.is_empty() {
            anyhow::bail!("At least one collection must be enabled");
        }
        let mut seen = HashSet::new();
        for collection in &self.enabled_collections {
            if collection.trim().is_empty() {
                anyhow::bail!("Collection names must not be empty");
            }
            if !seen.insert(collection.as_str()) {
                anyhow::bail!("Collection '{collection}' is listed more than once");
            }
        }
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than zero");
        }
        if self.max_retry_attempts == 0 {
            anyhow::bail!("Retry attempts must be at least 1");
        }
        if self.store_timeout.is_zero() {
            anyhow::bail!("Store timeout must be greater than zero");
        }
        if self.realtime_poll_interval.is_zero() {
            anyhow::bail!("Real-time poll interval must be greater than zero");
        }
        Ok(())
    }
}

/// Sync settings from the command line, with environment fallbacks.
#[derive(Args, Clone, Debug, Default)]
pub struct SyncOpts {
    /// TOML file with sync settings (flags override its values)
    #[arg(long = "config", value_name = "PATH", env = "SYNC_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Comma-separated collections to sync
    #[arg(long, env = "SYNC_COLLECTIONS", value_delimiter = ',')]
    pub collections: Option<Vec<String>>,

    /// Which way records flow
    #[arg(long, env = "SYNC_DIRECTION", value_enum)]
    pub direction: Option<SyncDirection>,

    /// Policy for records present in both stores
    #[arg(long, env = "SYNC_CONFLICT_RESOLUTION", value_enum)]
    pub conflict_resolution: Option<ConflictResolution>,

    /// Maximum records per collection pass
    #[arg(long, env = "SYNC_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Full sync period, e.g. "5m" or "300000" (milliseconds); 0 disables it
    #[arg(long, env = "SYNC_INTERVAL", value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// Attempts a queued sync job gets before it is dropped
    #[arg(long, env = "SYNC_RETRY_ATTEMPTS")]
    pub retry_attempts: Option<u32>,

    /// Mirror relational changes into the content store as they happen
    #[arg(long, env = "SYNC_REALTIME")]
    pub realtime: Option<bool>,

    /// Timeout for each store call, e.g. "30s"
    #[arg(long, env = "SYNC_STORE_TIMEOUT", value_parser = parse_duration)]
    pub store_timeout: Option<Duration>,

    /// Base delay of the retry backoff, e.g. "1s"
    #[arg(long, env = "SYNC_RETRY_BASE_DELAY", value_parser = parse_duration)]
    pub retry_base_delay: Option<Duration>,

    /// Change feed polling cadence, e.g. "500ms"
    #[arg(long, env = "SYNC_REALTIME_POLL_INTERVAL", value_parser = parse_duration)]
    pub realtime_poll_interval: Option<Duration>,
}

impl SyncOpts {
    /// Resolve the effective, validated configuration.
    pub fn to_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config_file {
            Some(path) => SyncConfig::from_file(path)?,
            None => SyncConfig::default(),
        };

        if let Some(collections) = &self.collections {
            config.enabled_collections = collections
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(direction) = self.direction {
            config.sync_direction = direction;
        }
        if let Some(policy) = self.conflict_resolution {
            config.conflict_resolution = policy;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(interval) = self.interval {
            config.sync_interval = interval;
        }
        if let Some(attempts) = self.retry_attempts {
            config.max_retry_attempts = attempts;
        }
        if let Some(realtime) = self.realtime {
            config.realtime_enabled = realtime;
        }
        if let Some(timeout) = self.store_timeout {
            config.store_timeout = timeout;
        }
        if let Some(delay) = self.retry_base_delay {
            config.retry_base_delay = delay;
        }
        if let Some(poll) = self.realtime_poll_interval {
            config.realtime_poll_interval = poll;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.enabled_collections.len(), 15);
        assert!(config.is_enabled("service-packages"));
        assert_eq!(config.sync_direction, SyncDirection::Bidirectional);
        assert_eq!(config.conflict_resolution, ConflictResolution::LastWriteWins);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.max_retry_attempts, 3);
        assert!(config.realtime_active());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            enabled_collections = ["services", "pages"]
            sync_direction = "content-to-relational"
            conflict_resolution = "manual"
            batch_size = 2
            sync_interval = 60000
            store_timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.enabled_collections, vec!["services", "pages"]);
        assert_eq!(config.sync_direction, SyncDirection::ContentToRelational);
        assert_eq!(config.conflict_resolution, ConflictResolution::Manual);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        // untouched keys keep their defaults
        assert_eq!(config.max_retry_attempts, 3);
        assert!(!config.realtime_active());
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(SyncConfig::from_toml_str("batchsize = 3").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = SyncConfig {
            enabled_collections: vec!["a".into(), "a".into()],
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        config.enabled_collections = vec![];
        assert!(config.validate().is_err());

        config.enabled_collections = vec!["a".into()];
        config.batch_size = 0;
        assert!(config.validate().is_err());

        config.batch_size = 1;
        config.max_retry_attempts = 0;
        assert!(config.validate().is_err());

        config.max_retry_attempts = 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_opts_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = 10\nenabled_collections = [\"users\"]").unwrap();

        let opts = SyncOpts {
            config_file: Some(file.path().to_path_buf()),
            batch_size: Some(25),
            collections: Some(vec!["users".into(), " pages ".into(), "".into()]),
            direction: Some(SyncDirection::RelationalToContent),
            ..SyncOpts::default()
        };
        let config = opts.to_config().unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.enabled_collections, vec!["users", "pages"]);
        assert_eq!(config.sync_direction, SyncDirection::RelationalToContent);
    }

    #[test]
    fn test_direction_flags() {
        assert!(SyncDirection::Bidirectional.writes_content());
        assert!(SyncDirection::Bidirectional.writes_relational());
        assert!(!SyncDirection::ContentToRelational.writes_content());
        assert!(!SyncDirection::RelationalToContent.writes_relational());
    }
}
