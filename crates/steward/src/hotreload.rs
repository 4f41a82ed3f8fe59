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

//! Hot-reload coordination
//!
//! Consumes file-change events. Paths registered as hot-reloadable map to
//! a `Reloadable` implementation - data-, template-, or config-driven
//! behavior that can be swapped in the running process. Everything else is
//! only raised to the callback registry; the web layer decides what to do
//! with it. This module never restarts the worker process, and a failed
//! reload keeps the previous in-memory behavior running.

use crate::callbacks::CallbackRegistry;
use crate::watcher::ChangeEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// A component whose behavior can be replaced in-process when its backing
/// file changes. Compiled-code changes are not reloadable and always take
/// the process-restart path instead.
pub trait Reloadable: Send + Sync {
    fn name(&self) -> &str;

    fn reload(&self, path: &Path) -> anyhow::Result<()>;
}

pub struct HotReloadCoordinator {
    install_root: PathBuf,
    reloadables: Mutex<HashMap<PathBuf, Arc<dyn Reloadable>>>,
    registry: Arc<CallbackRegistry>,
}

impl std::fmt::Debug for HotReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadCoordinator")
            .field("install_root", &self.install_root)
            .field("reloadables", &self.reloadables.lock().len())
            .finish()
    }
}

impl HotReloadCoordinator {
    pub fn new(install_root: impl Into<PathBuf>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            install_root: install_root.into(),
            reloadables: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Mark a path (relative to the install root) as hot-reloadable
    pub fn register(&self, rel_path: impl Into<PathBuf>, reloadable: Arc<dyn Reloadable>) {
        let rel = rel_path.into();
        info!("Registered hot-reloadable {} for {}", reloadable.name(), rel.display());
        self.reloadables.lock().insert(rel, reloadable);
    }

    fn lookup(&self, path: &Path) -> Option<Arc<dyn Reloadable>> {
        let rel = path.strip_prefix(&self.install_root).unwrap_or(path);
        self.reloadables.lock().get(rel).cloned()
    }

    /// Handle one change event: reload in place when possible, and always
    /// raise the event to registered callbacks.
    pub fn handle(&self, event: &ChangeEvent) {
        if let Some(reloadable) = self.lookup(&event.path) {
            match reloadable.reload(&event.path) {
                Ok(()) => {
                    info!(
                        "Hot-reloaded {} from {}",
                        reloadable.name(),
                        event.path.display()
                    );
                }
                Err(e) => {
                    // Non-fatal: previous in-memory behavior stays active
                    warn!(
                        "Hot reload of {} failed, keeping previous version: {e}",
                        reloadable.name()
                    );
                }
            }
        }

        self.registry.notify_file_changed(event);
    }

    /// Drain change events until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: UnboundedReceiver<ChangeEvent>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Hot-reload coordinator shutting down");
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(&event),
                        None => return,
                    }
                }
            }
        }
    }
}
