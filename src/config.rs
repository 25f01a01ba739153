//! Configuration file parser for `podcrawl.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use chrono::TimeDelta;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::{SchedulePolicy, MIN_INFLATION_FACTOR};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is outside its usable range.
    #[error("Invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level ingestion configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the SQLite catalog.
    pub database_path: PathBuf,

    /// Number of long-lived workers in the ingestion pool.
    pub workers: usize,

    /// Maximum number of due podcasts claimed per run.
    pub limit: usize,

    /// Per-request timeout for feed fetches, in seconds.
    pub request_timeout_secs: u64,

    /// Upper bound on a feed response body, in bytes.
    pub max_feed_size: usize,

    /// `User-Agent` header sent with every fetch.
    pub user_agent: String,

    /// Consecutive failures tolerated before a podcast is deactivated.
    pub max_retries: i64,

    pub scheduler: SchedulerConfig,
}

/// Tunable constants for the update-frequency policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frequency used when a feed has fewer than two dated items.
    pub default_frequency_hours: i64,

    /// Lower clamp applied to every rescheduled frequency.
    pub min_frequency_hours: i64,

    /// Absolute ceiling: a podcast not parsed for this long is always due.
    pub max_frequency_days: i64,

    /// Growth applied per step while a quiet podcast is rescheduled (0.01 = 1%).
    pub inflation_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("podcrawl.db"),
            workers: 10,
            limit: 360,
            request_timeout_secs: 10,
            max_feed_size: 10 * 1024 * 1024,
            user_agent: format!("podcrawl/{}", env!("CARGO_PKG_VERSION")),
            max_retries: 12,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_frequency_hours: 24,
            min_frequency_hours: 1,
            max_frequency_days: 7,
            inflation_factor: 0.01,
        }
    }
}

impl SchedulerConfig {
    /// Ten years, in hours and days.
    const MAX_FREQUENCY_HOURS: i64 = 24 * 3650;
    const MAX_FREQUENCY_DAYS: i64 = 3650;
    const MAX_INFLATION_FACTOR: f64 = 10.0;

    fn validate(&self) -> Result<(), ConfigError> {
        let hours = [
            ("scheduler.default_frequency_hours", self.default_frequency_hours),
            ("scheduler.min_frequency_hours", self.min_frequency_hours),
        ];
        for (key, value) in hours {
            if !(1..=Self::MAX_FREQUENCY_HOURS).contains(&value) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} is outside 1..={}", Self::MAX_FREQUENCY_HOURS),
                });
            }
        }
        if !(1..=Self::MAX_FREQUENCY_DAYS).contains(&self.max_frequency_days) {
            return Err(ConfigError::Invalid {
                key: "scheduler.max_frequency_days",
                reason: format!(
                    "{} is outside 1..={}",
                    self.max_frequency_days,
                    Self::MAX_FREQUENCY_DAYS
                ),
            });
        }
        if self.min_frequency_hours > self.max_frequency_days * 24 {
            return Err(ConfigError::Invalid {
                key: "scheduler.min_frequency_hours",
                reason: "exceeds scheduler.max_frequency_days".into(),
            });
        }
        // NaN fails both comparisons
        if !(self.inflation_factor >= MIN_INFLATION_FACTOR
            && self.inflation_factor <= Self::MAX_INFLATION_FACTOR)
        {
            return Err(ConfigError::Invalid {
                key: "scheduler.inflation_factor",
                reason: format!(
                    "{} is outside {MIN_INFLATION_FACTOR}..={}",
                    self.inflation_factor,
                    Self::MAX_INFLATION_FACTOR
                ),
            });
        }
        Ok(())
    }

    /// Converts the file representation into the policy used by the scheduler.
    pub fn policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            default_frequency: TimeDelta::hours(self.default_frequency_hours),
            min_frequency: TimeDelta::hours(self.min_frequency_hours),
            max_frequency: TimeDelta::days(self.max_frequency_days),
            inflation_factor: self.inflation_factor,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "database_path",
                "workers",
                "limit",
                "request_timeout_secs",
                "max_feed_size",
                "user_agent",
                "max_retries",
                "scheduler",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            workers = config.workers,
            limit = config.limit,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Rejects values that would stall the pool or the scheduler loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        self.scheduler.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
