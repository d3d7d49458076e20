//! Application directory paths for recurra.
//!
//! Uses the [`dirs`] crate for platform-appropriate locations.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data (stores, logs, workspaces) | `~/Library/Application Support/recurra/` | `~/.local/share/recurra/` |
//! | Config | `~/Library/Application Support/recurra/` | `~/.config/recurra/` |
//!
//! # Environment Overrides
//!
//! - `RECURRA_DATA_DIR` overrides [`data_dir`]
//! - `RECURRA_CONFIG_DIR` overrides [`config_dir`]

use crate::scheduler::store::{JOBS_FILE, RUNS_FILE};
use std::path::PathBuf;

/// Application data root directory.
///
/// Resolves to `dirs::data_dir()/recurra/` unless `RECURRA_DATA_DIR` is set.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("RECURRA_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("recurra"))
        .unwrap_or_else(|| PathBuf::from("/tmp/recurra-data"))
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/recurra/` unless `RECURRA_CONFIG_DIR` is set.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("RECURRA_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("recurra"))
        .unwrap_or_else(|| PathBuf::from("/tmp/recurra-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Per-run scratch directories (`data_dir()/workspaces/`).
#[must_use]
pub fn workspaces_dir() -> PathBuf {
    data_dir().join("workspaces")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Jobs store (`data_dir()/jobs.json`).
#[must_use]
pub fn jobs_file() -> PathBuf {
    data_dir().join(JOBS_FILE)
}

/// Runs store (`data_dir()/runs.json`).
#[must_use]
pub fn runs_file() -> PathBuf {
    data_dir().join(RUNS_FILE)
}
