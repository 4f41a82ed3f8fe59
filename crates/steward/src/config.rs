// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Steward.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for steward

use crate::error::{Result, StewardError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Remote source-of-truth settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Repository in `owner/name` form
    pub repo: String,

    /// Branch whose head is treated as the latest revision
    pub branch: String,

    /// Auth token for private repositories (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Custom API base URL for testing (overrides the default GitHub API)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Custom raw-content base URL for testing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base_url: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            repo: "SolarE-cz/steward-worker".to_string(),
            branch: "main".to_string(),
            token: None,
            api_base_url: None,
            content_base_url: None,
        }
    }
}

/// The managed file set: which parts of the install tree the updater is
/// allowed to read, write, and delete
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedConfig {
    /// Recognized source-like extensions (closed allow-list)
    pub extensions: Vec<String>,

    /// Top-level directories that are never touched (user data, logs,
    /// model weights)
    pub deny: Vec<String>,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            extensions: ["py", "js", "css", "html", "json", "toml"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            deny: ["data", "logs", "uploads", "models"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Worker process launch and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable
    pub command: String,

    /// Arguments passed to the worker
    pub args: Vec<String>,

    /// Working directory for the worker (defaults to the install dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Environment variables passed to the worker (model/config paths)
    pub env: BTreeMap<String, String>,

    /// Optional HTTP health endpoint probed during startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    /// How long the worker may take to become live
    pub startup_timeout_secs: u64,

    /// Minimum time the process must stay alive before it counts as started
    pub startup_grace_ms: u64,

    /// SIGTERM grace period before SIGKILL
    pub graceful_timeout_secs: u64,

    /// Crash-loop circuit breaker: max restarts within the window
    pub crash_restart_limit: usize,

    /// Crash-loop rolling window in seconds
    pub crash_window_secs: u64,

    /// How often the crash watcher polls the child
    pub poll_interval_ms: u64,

    /// Base delay for the crash-restart exponential backoff
    pub backoff_base_ms: u64,

    /// Backoff cap
    pub backoff_cap_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "/app/worker".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            health_url: None,
            startup_timeout_secs: 30,
            startup_grace_ms: 2000,
            graceful_timeout_secs: 30,
            crash_restart_limit: 5,
            crash_window_secs: 600,
            poll_interval_ms: 1000,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    /// Enable automatic updates
    pub auto_update: bool,

    /// How often to check for new revisions (seconds)
    pub check_interval_secs: u64,

    /// Where staging, snapshots, and persisted state live
    pub data_dir: PathBuf,

    /// The live installation tree
    pub install_dir: PathBuf,

    pub remote: RemoteConfig,

    pub managed: ManagedConfig,

    pub worker: WorkerConfig,

    /// How many snapshots to retain
    pub snapshot_retain: usize,

    /// How long the worker must run stably before the newest snapshot is
    /// confirmed good and older ones become prunable (seconds)
    pub snapshot_confirm_secs: u64,

    /// Per-path debounce for the file watcher (seconds)
    pub debounce_secs: u64,

    /// Bounded archive of finished update jobs
    pub job_history_limit: usize,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            auto_update: true,
            check_interval_secs: 30,
            data_dir: PathBuf::from("/data/steward"),
            install_dir: PathBuf::from("/app"),
            remote: RemoteConfig::default(),
            managed: ManagedConfig::default(),
            worker: WorkerConfig::default(),
            snapshot_retain: 3,
            snapshot_confirm_secs: 3600,
            debounce_secs: 2,
            job_history_limit: 32,
        }
    }
}

impl StewardConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

pub fn load_config(path: &Path) -> Result<StewardConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| StewardError::Config(format!("Failed to parse config: {e}")))
    } else {
        // Create with defaults
        let config = StewardConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &StewardConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steward.json");

        let config = load_config(&path).unwrap();
        assert!(config.auto_update);
        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.snapshot_retain, 3);
        assert_eq!(config.debounce_secs, 2);
        assert!(path.exists());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steward.json");

        let config = StewardConfig {
            auto_update: false,
            check_interval_secs: 120,
            data_dir: PathBuf::from("/tmp/steward"),
            install_dir: PathBuf::from("/srv/app"),
            snapshot_retain: 5,
            ..StewardConfig::default()
        };
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert!(!loaded.auto_update);
        assert_eq!(loaded.check_interval_secs, 120);
        assert_eq!(loaded.data_dir, PathBuf::from("/tmp/steward"));
        assert_eq!(loaded.snapshot_retain, 5);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steward.json");
        std::fs::write(&path, r#"{"check_interval_secs": 60}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.check_interval_secs, 60);
        assert!(config.auto_update);
        assert_eq!(config.worker.crash_restart_limit, 5);
        assert_eq!(config.worker.crash_window_secs, 600);
        assert_eq!(config.managed.deny, ManagedConfig::default().deny);
    }

    #[test]
    fn test_derived_paths() {
        let config = StewardConfig {
            data_dir: PathBuf::from("/data/steward"),
            ..StewardConfig::default()
        };
        assert_eq!(config.staging_dir(), PathBuf::from("/data/steward/staging"));
        assert_eq!(
            config.snapshots_dir(),
            PathBuf::from("/data/steward/snapshots")
        );
        assert_eq!(config.state_path(), PathBuf::from("/data/steward/state.json"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steward.json");
        std::fs::write(&path, "not json").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(StewardError::Config(_))));
    }
}
