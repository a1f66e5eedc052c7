//! Coordinator configuration, loaded from a TOML file.
//!
//! Every field has a default so an empty or missing file yields a working
//! setup. The default location is `<config dir>/hive/config.toml`.

use std::path::{Path, PathBuf};

use hive_protocol::{DEFAULT_COMMIT_TIMEOUT_MS, DEFAULT_VOTE_TTL_SECS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory for durable swarm state. `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
    /// How long a submitted command may wait for commit acknowledgment.
    pub commit_timeout_ms: u64,
    /// Interval of the background sweep (stale members, expired votes
    /// and messages).
    pub sweep_interval_ms: u64,
    /// TTL applied to votes opened without an explicit one.
    pub default_vote_ttl_secs: i64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
            sweep_interval_ms: 1_000,
            default_vote_ttl_secs: DEFAULT_VOTE_TTL_SECS,
            log_filter: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from `path`, falling back to defaults when the file does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// `<config dir>/hive/config.toml`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hive").join("config.toml"))
    }

    /// Install the global tracing subscriber. `RUST_LOG` wins over the
    /// configured filter. Safe to call more than once; later calls are
    /// no-ops.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_filter.clone()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = CoordinatorConfig::load(Path::new("/nonexistent/hive.toml")).unwrap();
        assert_eq!(config.commit_timeout_ms, DEFAULT_COMMIT_TIMEOUT_MS);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "commit_timeout_ms = 250\nlog_filter = \"debug\"\n").unwrap();

        let config = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(config.commit_timeout_ms, 250);
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.default_vote_ttl_secs, DEFAULT_VOTE_TTL_SECS);
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "commit_timeout_ms = \"soon\"\n").unwrap();
        assert!(matches!(
            CoordinatorConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = CoordinatorConfig {
            data_dir: Some(PathBuf::from("/var/lib/hive")),
            ..Default::default()
        };
        let raw = toml::to_string(&config).unwrap();
        let back: CoordinatorConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.data_dir, config.data_dir);
    }
}
