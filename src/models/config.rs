//! Configuration for perdura.
//!
//! Every tunable of the checkpoint schedule, retry policy and circuit breaker
//! is parameterized here. The value is built once (file or defaults), validated,
//! and handed to each component at construction time. Nothing in the crate
//! reads the process environment for settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One point of the checkpoint schedule.
///
/// When a run has been going for `elapsed_sec`, the checkpoint loop saves a
/// checkpoint reporting `progress_pct` under the label `phase_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Seconds since the run started
    pub elapsed_sec: u64,
    /// Progress reported at this point (0-100)
    pub progress_pct: f64,
    /// Human-readable phase label
    pub phase_name: String,
    /// Whether a checkpoint taken here is worth resuming from
    #[serde(default = "default_true")]
    pub resumable: bool,
}

impl ScheduleEntry {
    pub fn new(elapsed_sec: u64, progress_pct: f64, phase_name: &str, resumable: bool) -> Self {
        Self {
            elapsed_sec,
            progress_pct,
            phase_name: phase_name.to_string(),
            resumable,
        }
    }
}

/// Top-level configuration.
///
/// All durations are expressed in seconds in the file; use the accessor
/// methods to get [`Duration`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Maximum attempts per operation (including the first)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay: f64,

    /// Upper bound for any single backoff delay
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: f64,

    /// Growth factor of the backoff delay per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the uniform random jitter added to each delay
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Consecutive rate-limit failures that open a circuit
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,

    /// Time an open circuit waits before allowing probes
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout: f64,

    /// Probe attempts allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub circuit_breaker_half_open_max_calls: u32,

    /// Wake-up interval of the background checkpoint loop
    #[serde(default = "default_check_interval")]
    pub checkpoint_check_interval: f64,

    /// Retention window for checkpoints and backups
    #[serde(default = "default_checkpoint_max_age")]
    pub checkpoint_max_age: f64,

    /// Minimum time between two automatic expiry sweeps
    #[serde(default = "default_cleanup_interval")]
    pub checkpoint_cleanup_interval: f64,

    /// Checkpoints older than this are not resumed from
    #[serde(default = "default_resume_max_age")]
    pub resume_max_age: f64,

    /// Retention window for finished progress records
    #[serde(default = "default_progress_retention")]
    pub progress_retention: f64,

    /// Root directory for checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Root directory for progress files
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,

    /// Write a timestamped backup next to every checkpoint
    #[serde(default = "default_true")]
    pub keep_backups: bool,

    /// Checkpoint schedule, strictly increasing in `elapsed_sec`
    #[serde(default = "default_schedule")]
    pub checkpoint_schedule: Vec<ScheduleEntry>,
}

fn default_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::new(120, 10.0, "initial_research", true),
        ScheduleEntry::new(300, 25.0, "source_gathering", true),
        ScheduleEntry::new(600, 50.0, "analysis", true),
        ScheduleEntry::new(900, 75.0, "synthesis", true),
        ScheduleEntry::new(1200, 90.0, "finalizing", false),
    ]
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_retry_delay() -> f64 {
    2.0
}

fn default_max_retry_delay() -> f64 {
    300.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    1.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> f64 {
    60.0
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_check_interval() -> f64 {
    30.0
}

fn default_checkpoint_max_age() -> f64 {
    7.0 * 24.0 * 3600.0
}

fn default_cleanup_interval() -> f64 {
    3600.0
}

fn default_resume_max_age() -> f64 {
    24.0 * 3600.0
}

fn default_progress_retention() -> f64 {
    3.0 * 24.0 * 3600.0
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".perdura/checkpoints")
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from(".perdura/progress")
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay: default_base_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_jitter: default_retry_jitter(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_timeout: default_breaker_timeout(),
            circuit_breaker_half_open_max_calls: default_half_open_max_calls(),
            checkpoint_check_interval: default_check_interval(),
            checkpoint_max_age: default_checkpoint_max_age(),
            checkpoint_cleanup_interval: default_cleanup_interval(),
            resume_max_age: default_resume_max_age(),
            progress_retention: default_progress_retention(),
            checkpoint_dir: default_checkpoint_dir(),
            progress_dir: default_progress_dir(),
            keep_backups: true,
            checkpoint_schedule: default_schedule(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Write this configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Check every invariant the components rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_schedule.is_empty() {
            return Err(invalid("checkpoint_schedule", "must not be empty"));
        }

        let mut previous: Option<u64> = None;
        for (i, entry) in self.checkpoint_schedule.iter().enumerate() {
            if let Some(prev) = previous {
                if entry.elapsed_sec <= prev {
                    return Err(invalid(
                        "checkpoint_schedule",
                        format!(
                            "elapsed_sec must be strictly increasing (entry {i}: {} <= {prev})",
                            entry.elapsed_sec
                        ),
                    ));
                }
            }
            if !(0.0..=100.0).contains(&entry.progress_pct) {
                return Err(invalid(
                    "checkpoint_schedule",
                    format!(
                        "progress_pct must be within [0, 100] (entry {i}: {})",
                        entry.progress_pct
                    ),
                ));
            }
            if entry.phase_name.trim().is_empty() {
                return Err(invalid(
                    "checkpoint_schedule",
                    format!("phase_name must not be empty (entry {i})"),
                ));
            }
            previous = Some(entry.elapsed_sec);
        }

        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }

        for (field, value) in [
            ("base_retry_delay", self.base_retry_delay),
            ("max_retry_delay", self.max_retry_delay),
            ("circuit_breaker_timeout", self.circuit_breaker_timeout),
            ("checkpoint_check_interval", self.checkpoint_check_interval),
            ("checkpoint_max_age", self.checkpoint_max_age),
            ("checkpoint_cleanup_interval", self.checkpoint_cleanup_interval),
            ("resume_max_age", self.resume_max_age),
            ("progress_retention", self.progress_retention),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(field, format!("must be positive (got {value})")));
            }
        }

        if self.max_retry_delay < self.base_retry_delay {
            return Err(invalid(
                "max_retry_delay",
                format!(
                    "must be >= base_retry_delay ({} < {})",
                    self.max_retry_delay, self.base_retry_delay
                ),
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("backoff_multiplier", "must be >= 1.0"));
        }

        if !self.retry_jitter.is_finite() || self.retry_jitter < 0.0 {
            return Err(invalid("retry_jitter", "must be >= 0"));
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(invalid("circuit_breaker_failure_threshold", "must be at least 1"));
        }

        if self.circuit_breaker_half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker_half_open_max_calls", "must be at least 1"));
        }

        Ok(())
    }

    pub fn base_retry_delay(&self) -> Duration {
        secs(self.base_retry_delay)
    }

    pub fn max_retry_delay(&self) -> Duration {
        secs(self.max_retry_delay)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        secs(self.circuit_breaker_timeout)
    }

    pub fn checkpoint_check_interval(&self) -> Duration {
        secs(self.checkpoint_check_interval)
    }

    pub fn checkpoint_max_age(&self) -> Duration {
        secs(self.checkpoint_max_age)
    }

    pub fn checkpoint_cleanup_interval(&self) -> Duration {
        secs(self.checkpoint_cleanup_interval)
    }

    pub fn resume_max_age(&self) -> Duration {
        secs(self.resume_max_age)
    }

    pub fn progress_retention(&self) -> Duration {
        secs(self.progress_retention)
    }

    /// Commented example configuration, as printed by `perdura example`.
    pub fn example_toml() -> &'static str {
        EXAMPLE_CONFIG
    }
}

/// Values too large for a `Duration` saturate, so "effectively forever"
/// never collapses into zero.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

const EXAMPLE_CONFIG: &str = r#"# perdura configuration file
# All durations are in seconds.

# Retry policy: delay = min(max_retry_delay, base_retry_delay * backoff_multiplier^attempt + jitter)
max_retries = 5
base_retry_delay = 2.0
max_retry_delay = 300.0
backoff_multiplier = 2.0
retry_jitter = 1.0

# Circuit breaker (per provider and operation class)
circuit_breaker_failure_threshold = 5
circuit_breaker_timeout = 60.0
circuit_breaker_half_open_max_calls = 1

# Checkpoint housekeeping
checkpoint_check_interval = 30.0
checkpoint_max_age = 604800.0      # 7 days
checkpoint_cleanup_interval = 3600.0
resume_max_age = 86400.0           # checkpoints older than a day start fresh
progress_retention = 259200.0      # 3 days

checkpoint_dir = ".perdura/checkpoints"
progress_dir = ".perdura/progress"
keep_backups = true

# When a run has been going for elapsed_sec, save a checkpoint at progress_pct.
# Late checkpoints can be marked non-resumable: resuming them costs more than restarting.
[[checkpoint_schedule]]
elapsed_sec = 120
progress_pct = 10.0
phase_name = "initial_research"

[[checkpoint_schedule]]
elapsed_sec = 300
progress_pct = 25.0
phase_name = "source_gathering"

[[checkpoint_schedule]]
elapsed_sec = 600
progress_pct = 50.0
phase_name = "analysis"

[[checkpoint_schedule]]
elapsed_sec = 900
progress_pct = 75.0
phase_name = "synthesis"

[[checkpoint_schedule]]
elapsed_sec = 1200
progress_pct = 90.0
phase_name = "finalizing"
resumable = false
"#;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_example_matches_default() {
        let parsed = Config::from_toml_str(Config::example_toml()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perdura.toml");

        let mut config = Config::default();
        config.max_retries = 7;
        config.checkpoint_schedule = vec![
            ScheduleEntry::new(5, 12.5, "warmup", true),
            ScheduleEntry::new(30, 40.0, "gather", true),
            ScheduleEntry::new(90, 95.0, "wrap_up", false),
        ];
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.checkpoint_schedule[1].phase_name, "gather");
        loaded.validate().unwrap();
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = Config::from_toml_str("max_retries = 2\n").unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.checkpoint_schedule, default_schedule());
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let mut config = Config::default();
        config.checkpoint_max_age = 1e20;
        config.max_retry_delay = 1e20;
        config.resume_max_age = f64::MAX;
        config.validate().unwrap();
        assert_eq!(config.checkpoint_max_age(), Duration::MAX);
        assert_eq!(config.max_retry_delay(), Duration::MAX);
        assert_eq!(config.resume_max_age(), Duration::MAX);
        assert_eq!(config.base_retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_empty_schedule() {
        let mut config = Config::default();
        config.checkpoint_schedule.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "checkpoint_schedule"
        ));
    }

    #[test]
    fn test_rejects_non_increasing_schedule() {
        let mut config = Config::default();
        config.checkpoint_schedule = vec![
            ScheduleEntry::new(60, 10.0, "a", true),
            ScheduleEntry::new(60, 20.0, "b", true),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_percentage() {
        let mut config = Config::default();
        config.checkpoint_schedule = vec![ScheduleEntry::new(60, 120.0, "a", true)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let mut config = Config::default();
        config.base_retry_delay = 10.0;
        config.max_retry_delay = 5.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "max_retry_delay"
        ));

        let mut config = Config::default();
        config.base_retry_delay = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_retries = 0\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
