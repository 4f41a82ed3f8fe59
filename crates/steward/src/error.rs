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

//! Error types for the steward crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("restore incomplete: {0}")]
    Restore(String),

    #[error("apply failed (rolled_back={rolled_back}): {reason}")]
    Apply { rolled_back: bool, reason: String },

    #[error("process error: {0}")]
    Process(String),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker did not become live within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    #[error("crash loop: {crashes} crashes within {window_secs}s, giving up")]
    CrashLoop { crashes: usize, window_secs: u64 },

    #[error("an update job is already in flight")]
    Busy,

    #[error("watcher error: {0}")]
    Watch(String),
}

impl StewardError {
    /// Errors that leave the installation in an unknown or unsafe state.
    /// These pause auto-update until an operator re-enables it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Apply { rolled_back, .. } => !rolled_back,
            Self::CrashLoop { .. } | Self::Restore(_) => true,
            Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Network(_)
            | Self::Integrity(_)
            | Self::Snapshot(_)
            | Self::Process(_)
            | Self::AlreadyRunning
            | Self::StartupTimeout { .. }
            | Self::Busy
            | Self::Watch(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StewardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolled_back_apply_is_recoverable() {
        let err = StewardError::Apply {
            rolled_back: true,
            reason: "copy failed".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unrolled_apply_is_fatal() {
        let err = StewardError::Apply {
            rolled_back: false,
            reason: "copy and restore both failed".to_string(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_crash_loop_is_fatal() {
        let err = StewardError::CrashLoop {
            crashes: 5,
            window_secs: 600,
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_network_is_recoverable() {
        assert!(!StewardError::Network("timeout".to_string()).is_fatal());
    }
}
