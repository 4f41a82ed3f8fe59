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

//! Persisted controller state
//!
//! A small JSON file under the data dir records what must survive a
//! restart of steward itself: the revision currently installed, whether
//! auto-update is enabled, and which snapshot is still awaiting its
//! stability confirmation.

use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerState {
    /// Revision currently installed in the live tree
    pub current_revision: Option<String>,

    /// Whether the poll loop acts on new revisions
    #[serde(default = "default_true")]
    pub auto_update_enabled: bool,

    /// Last time the remote was polled
    pub last_check_at: Option<DateTime<Utc>>,

    /// Last successful update
    pub last_update_at: Option<DateTime<Utc>>,

    /// Snapshot taken before the most recent apply, not yet confirmed good
    pub pending_confirm_snapshot: Option<String>,

    /// Newest snapshot that survived the stability grace period
    pub confirmed_snapshot: Option<String>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            current_revision: None,
            auto_update_enabled: true,
            last_check_at: None,
            last_update_at: None,
            pending_confirm_snapshot: None,
            confirmed_snapshot: None,
        }
    }
}

pub fn load_state(path: &Path) -> Result<ControllerState> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            StewardError::Config(format!("Failed to parse state file: {e}"))
        })
    } else {
        let state = ControllerState::default();
        save_state(path, &state)?;
        Ok(state)
    }
}

pub fn save_state(path: &Path, state: &ControllerState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(state)?;

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
    fn test_default_state() {
        let state = ControllerState::default();
        assert!(state.current_revision.is_none());
        assert!(state.auto_update_enabled);
        assert!(state.last_check_at.is_none());
        assert!(state.pending_confirm_snapshot.is_none());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = ControllerState {
            current_revision: Some("9f2c1aa".to_string()),
            auto_update_enabled: false,
            last_check_at: Some(Utc::now()),
            last_update_at: Some(Utc::now()),
            pending_confirm_snapshot: Some("20250102T030405Z".to_string()),
            confirmed_snapshot: None,
        };
        save_state(&path, &state).unwrap();

        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.current_revision, state.current_revision);
        assert_eq!(loaded.auto_update_enabled, state.auto_update_enabled);
        assert_eq!(
            loaded.pending_confirm_snapshot,
            state.pending_confirm_snapshot
        );
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = load_state(&path).unwrap();
        assert!(state.current_revision.is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        save_state(&path, &ControllerState::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
