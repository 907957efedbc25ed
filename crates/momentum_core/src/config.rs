//! Engine configuration.
//!
//! # Responsibility
//! - Hold tunables for scanning, momentum scoring, scheduling and locking.
//! - Load them from TOML, falling back to defaults for missing sections.
//!
//! # Invariants
//! - A validated config never yields a recency factor above
//!   `STALLED_RECENCY_CEILING` at the stalled threshold, so a stalled project
//!   always has recency near zero.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest recency factor a project may still have when it crosses the
/// stalled threshold.
pub const STALLED_RECENCY_CEILING: f64 = 0.05;

const MAX_SCAN_WORKERS: usize = 16;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse { path, message } => {
                write!(f, "invalid config `{}`: {message}", path.display())
            }
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { .. } | Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Width of the fingerprint/decode worker pool.
    pub workers: usize,
    /// Upper bound for reading and decoding one document.
    pub document_timeout_ms: u64,
    /// Larger documents are reported unavailable instead of read.
    pub max_document_bytes: u64,
    /// File extensions considered part of the document tree.
    pub extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            document_timeout_ms: 5_000,
            max_document_bytes: 4 * 1024 * 1024,
            extensions: vec!["md".to_string()],
        }
    }
}

impl ScanConfig {
    pub fn document_timeout(&self) -> Duration {
        Duration::from_millis(self.document_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub half_life_days: f64,
    pub stalled_threshold_days: u32,
    pub completion_window_days: u32,
    pub frequency_window_days: u32,
    pub trend_lookback_days: u32,
    /// Minimum score delta that counts as improving/declining.
    pub trend_epsilon: f64,
    pub snapshot_retention_days: u32,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            half_life_days: 2.0,
            stalled_threshold_days: 14,
            completion_window_days: 7,
            frequency_window_days: 14,
            trend_lookback_days: 7,
            trend_epsilon: 0.05,
            snapshot_retention_days: 60,
        }
    }
}

impl MomentumConfig {
    /// Recency factor after `days` without activity.
    pub fn recency_after_days(&self, days: f64) -> f64 {
        (-std::f64::consts::LN_2 * days.max(0.0) / self.half_life_days).exp()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sync_interval_secs: u64,
    pub momentum_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            momentum_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory for cross-process advisory lock files. In-process locking
    /// is always on.
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scan: ScanConfig,
    pub momentum: MomentumConfig,
    pub scheduler: SchedulerConfig,
    pub locks: LockConfig,
}

impl EngineConfig {
    /// Loads config from a TOML file. A missing file yields defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.workers == 0 {
            return Err(ConfigError::Invalid("scan.workers must be > 0".to_string()));
        }
        if self.scan.document_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scan.document_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.scan.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "scan.extensions must list at least one extension".to_string(),
            ));
        }

        let momentum = &self.momentum;
        if !momentum.half_life_days.is_finite() || momentum.half_life_days <= 0.0 {
            return Err(ConfigError::Invalid(
                "momentum.half_life_days must be > 0".to_string(),
            ));
        }
        for (name, value) in [
            ("stalled_threshold_days", momentum.stalled_threshold_days),
            ("completion_window_days", momentum.completion_window_days),
            ("frequency_window_days", momentum.frequency_window_days),
            ("trend_lookback_days", momentum.trend_lookback_days),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("momentum.{name} must be > 0")));
            }
        }
        if momentum.snapshot_retention_days < momentum.trend_lookback_days {
            return Err(ConfigError::Invalid(
                "momentum.snapshot_retention_days must cover trend_lookback_days".to_string(),
            ));
        }
        let recency_at_threshold =
            momentum.recency_after_days(f64::from(momentum.stalled_threshold_days));
        if recency_at_threshold > STALLED_RECENCY_CEILING {
            return Err(ConfigError::Invalid(format!(
                "momentum.half_life_days {} leaves recency at {:.3} after {} stalled days; must be <= {}",
                momentum.half_life_days,
                recency_at_threshold,
                momentum.stalled_threshold_days,
                STALLED_RECENCY_CEILING
            )));
        }

        if self.scheduler.sync_interval_secs == 0 || self.scheduler.momentum_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, MAX_SCAN_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig};
    use std::fs;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            r#"
[momentum]
stalled_threshold_days = 21
half_life_days = 3.0

[scan]
workers = 3
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.momentum.stalled_threshold_days, 21);
        assert_eq!(config.scan.workers, 3);
        assert_eq!(config.momentum.completion_window_days, 7);
        assert_eq!(config.scheduler.sync_interval_secs, 300);
    }

    #[test]
    fn rejects_half_life_that_keeps_stalled_projects_warm() {
        let mut config = EngineConfig::default();
        config.momentum.half_life_days = 10.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("half_life_days")));
    }

    #[test]
    fn default_half_life_drives_recency_near_zero_at_threshold() {
        let config = EngineConfig::default();
        let recency = config.momentum.recency_after_days(14.0);
        assert!(recency < 0.01, "recency was {recency}");
    }
}
