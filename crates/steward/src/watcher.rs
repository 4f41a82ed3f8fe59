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

//! Filesystem change observation
//!
//! Watches the configured directories recursively and emits one
//! `ChangeEvent` per underlying notification, debounced per path so a
//! burst of writes to the same file produces one event. Only files with
//! recognized source-like extensions are reported - binary, log, and data
//! files are excluded by policy.

use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Ephemeral: produced here, consumed once by the hot-reload coordinator
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

/// Per-path leading-edge debounce: the first event passes, repeats within
/// the window are dropped.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_emit: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: HashMap::new(),
        }
    }

    pub fn admit(&mut self, path: &Path) -> bool {
        let now = Instant::now();
        match self.last_emit.get(path) {
            Some(&previous) if now.duration_since(previous) < self.window => false,
            _ => {
                self.last_emit.insert(path.to_path_buf(), now);
                true
            }
        }
    }
}

fn has_watched_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => extensions.iter().any(|allowed| allowed == ext),
        None => false,
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Owns the underlying notify watcher; events arrive on the returned
/// channel. Dropping the `FileWatcher` stops the watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}

impl FileWatcher {
    pub fn spawn(
        dirs: &[PathBuf],
        extensions: Vec<String>,
        debounce: Duration,
    ) -> Result<(Self, UnboundedReceiver<ChangeEvent>)> {
        let (tx, rx) = unbounded_channel();
        let debouncer = Arc::new(Mutex::new(Debouncer::new(debounce)));

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => handle_raw_event(&event, &extensions, &debouncer, &tx),
                Err(e) => warn!("File watch error: {e}"),
            }
        })
        .map_err(|e| StewardError::Watch(format!("Failed to create watcher: {e}")))?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| StewardError::Watch(format!("Failed to watch {}: {e}", dir.display())))?;
            debug!("Watching {} recursively", dir.display());
        }

        Ok((Self { _watcher: watcher }, rx))
    }
}

fn handle_raw_event(
    event: &Event,
    extensions: &[String],
    debouncer: &Arc<Mutex<Debouncer>>,
    tx: &UnboundedSender<ChangeEvent>,
) {
    let Some(kind) = change_kind(&event.kind) else {
        return;
    };

    for path in &event.paths {
        if !has_watched_extension(path, extensions) {
            continue;
        }
        if !debouncer.lock().admit(path) {
            continue;
        }
        let change = ChangeEvent {
            path: path.clone(),
            kind,
            observed_at: Utc::now(),
        };
        // Receiver gone means we are shutting down
        let _ = tx.send(change);
    }
}
