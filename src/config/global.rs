//! Global configuration.
//!
//! Loaded from an explicit path, ~/.config/loopd/loopd.yml or ./loopd.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::daemon::default_socket_path;
use crate::ownership::SpawnOwner;
use crate::recovery::StaleConfig;
use crate::runner::RunnerConfig;
use crate::store::default_db_path;

/// Global configuration for loopd.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log level override (error, warn, info, debug, trace).
    pub log_level: Option<String>,

    pub storage: StorageConfig,

    /// How to reach (or serve) the daemon.
    pub daemon: DaemonSection,

    /// Stale-runner detection.
    pub stale: StaleSection,

    pub runner: RunnerSection,

    pub ownership: OwnershipSection,
}

impl GlobalConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. ~/.config/loopd/loopd.yml
    /// 3. loopd.yml in current directory
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let mut candidates = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("loopd").join("loopd.yml"));
        }
        candidates.push(PathBuf::from("loopd.yml"));

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => {
                    log::info!("Loaded config from {}", candidate.display());
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load {}: {}", candidate.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.stale.threshold_secs == 0 {
            eyre::bail!("stale.threshold_secs must be > 0");
        }
        if self.stale.sweep_interval_secs == 0 {
            eyre::bail!("stale.sweep_interval_secs must be > 0");
        }
        if self.runner.heartbeat_interval_ms == 0 || self.runner.poll_interval_ms == 0 {
            eyre::bail!("runner intervals must be > 0");
        }
        // A heartbeat slower than the threshold would get live runners reclaimed
        if self.runner.heartbeat_interval_ms >= self.stale.threshold_secs * 1000 {
            eyre::bail!("runner.heartbeat_interval_ms must be shorter than stale.threshold_secs");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage.db_path.clone().unwrap_or_else(default_db_path)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon.socket_path.clone().unwrap_or_else(default_socket_path)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            heartbeat_interval: Duration::from_millis(self.runner.heartbeat_interval_ms),
            poll_interval: Duration::from_millis(self.runner.poll_interval_ms),
            output_tail_bytes: self.runner.output_tail_bytes,
        }
    }

    pub fn stale_config(&self) -> StaleConfig {
        StaleConfig::default()
            .with_threshold(Duration::from_secs(self.stale.threshold_secs))
            .with_sweep_interval(Duration::from_secs(self.stale.sweep_interval_secs))
            .with_auto_restart_default(self.stale.auto_restart_default)
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. Defaults to <data_local_dir>/loopd/loopd.db
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonSection {
    pub socket_path: Option<PathBuf>,

    /// Liveness probe timeout used by ownership resolution.
    pub probe_timeout_ms: u64,

    pub request_timeout_ms: u64,

    /// Grace period for runners on daemon shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: None,
            probe_timeout_ms: 500,
            request_timeout_ms: 10_000,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StaleSection {
    pub threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub auto_restart_default: bool,
}

impl Default for StaleSection {
    fn default() -> Self {
        Self {
            threshold_secs: 45 * 60,
            sweep_interval_secs: 60,
            auto_restart_default: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerSection {
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub output_tail_bytes: usize,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            poll_interval_ms: 1_000,
            output_tail_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OwnershipSection {
    /// Mode used when a command gets no --owner flag.
    pub default_mode: Option<SpawnOwner>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlobalConfig::default();
        assert_eq!(config.stale.threshold_secs, 2700);
        assert_eq!(config.stale.sweep_interval_secs, 60);
        assert!(!config.stale.auto_restart_default);
        assert_eq!(config.daemon.probe_timeout_ms, 500);
        assert!(config.ownership.default_mode.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
stale:
  threshold_secs: 600
  auto_restart_default: true
ownership:
  default_mode: auto
"#;
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stale.threshold_secs, 600);
        assert_eq!(config.stale.sweep_interval_secs, 60);
        assert_eq!(config.ownership.default_mode, Some(SpawnOwner::Auto));

        let stale = config.stale_config();
        assert_eq!(stale.threshold, Duration::from_secs(600));
        assert!(stale.auto_restart_default);
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("loopd.yml");
        fs::write(&path, "storage:\n  db_path: /var/lib/loopd.db\nrunner:\n  poll_interval_ms: 250\n").unwrap();

        let config = GlobalConfig::load(Some(&path)).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/loopd.db"));
        assert_eq!(config.runner_config().poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/loopd.yml");
        assert!(GlobalConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_heartbeat_must_beat_threshold() {
        let mut config = GlobalConfig::default();
        config.stale.threshold_secs = 10;
        config.runner.heartbeat_interval_ms = 10_000;
        assert!(config.validate().is_err());
    }
}
