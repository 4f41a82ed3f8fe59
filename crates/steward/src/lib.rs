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

//! Steward - a self-updating process supervisor
//!
//! Steward watches a remote source-of-truth for new revisions, stages and
//! verifies a full download, snapshots the managed file set, applies the
//! update with rollback on failure, and restarts (or hot-reloads parts of)
//! a supervised worker process.

pub mod applier;
pub mod callbacks;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetcher;
pub mod hotreload;
pub mod manifest;
pub mod process;
pub mod revision;
pub mod snapshot;
pub mod state;
pub mod watcher;

pub use config::StewardConfig;
pub use controller::{ControllerStatus, UpdateController, UpdateJob};
pub use error::{Result, StewardError};
pub use state::ControllerState;
