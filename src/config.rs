//! Configuration types for the recurra scheduler.

use crate::scheduler::clock::SystemClock;
use crate::scheduler::ledger::DEFAULT_MAX_RUNS_PER_JOB;
use crate::scheduler::recovery::{
    DEFAULT_MISSED_RUN_LOOKBACK_SECS, DEFAULT_STALE_RUN_THRESHOLD_SECS, RecoveryPolicy, secs,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Where the job and run stores live.
    pub storage: StorageConfig,
    /// Run history limits.
    pub retention: RetentionConfig,
    /// Start-up recovery behaviour.
    pub recovery: RecoveryConfig,
    /// Interpretation of daily schedule times.
    pub schedule: ScheduleConfig,
    /// Remote job sync.
    pub sync: SyncConfig,
    /// Built-in shell executor.
    pub executor: ExecutorConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Store location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `jobs.json` and `runs.json`.
    ///
    /// `None` uses [`crate::recurra_dirs::data_dir`].
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data directory.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::recurra_dirs::data_dir)
    }
}

/// Run history limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Most-recent runs kept per job.
    pub max_runs_per_job: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs_per_job: DEFAULT_MAX_RUNS_PER_JOB,
        }
    }
}

/// Start-up recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// A `Running` run older than this with no live handle is timed out.
    pub stale_run_threshold_secs: u64,
    /// A job that ran within this window is not caught up.
    pub missed_run_lookback_secs: u64,
    /// Run missed jobs immediately at start-up.
    pub catch_up_on_start: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_run_threshold_secs: DEFAULT_STALE_RUN_THRESHOLD_SECS,
            missed_run_lookback_secs: DEFAULT_MISSED_RUN_LOOKBACK_SECS,
            catch_up_on_start: true,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            stale_run_threshold: secs(self.stale_run_threshold_secs),
            missed_run_lookback: secs(self.missed_run_lookback_secs),
            catch_up_on_start: self.catch_up_on_start,
        }
    }
}

/// Zone for daily schedules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minutes east of UTC. `None` uses the host's offset at start-up.
    pub utc_offset_minutes: Option<i32>,
}

impl ScheduleConfig {
    /// Wall clock for the configured zone.
    #[must_use]
    pub fn clock(&self) -> SystemClock {
        match self.utc_offset_minutes {
            Some(minutes) => SystemClock::with_offset_minutes(minutes),
            None => SystemClock::local(),
        }
    }
}

/// Remote sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Base URL of the remote job API.
    pub base_url: Option<String>,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Whose jobs to sync. Sync is skipped while unset.
    pub principal: Option<String>,
    /// Seconds between periodic reconciles. `None` syncs only at start-up
    /// and on request.
    pub interval_secs: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            api_key: None,
            principal: None,
            interval_secs: None,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Principal to sync for, when sync is enabled and one is set.
    #[must_use]
    pub fn active_principal(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.principal.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// Shell executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used as `<shell> -c <query>`.
    pub shell: String,
    /// Output beyond this many characters is truncated.
    pub max_output_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_owned(),
            max_output_chars: 8_000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Also write daily-rotated log files under the logs directory.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: true,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SchedulerError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SchedulerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::recurra_dirs::config_file()
    }
}
