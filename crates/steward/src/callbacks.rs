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

//! Notification sink boundary
//!
//! External collaborators (web layer, mail/chat transports) register
//! callbacks here; steward only ever pushes events through them. The
//! registry is append-only for the life of the process, callbacks are
//! invoked in registration order, and a callback can never block or break
//! the update flow from the registry's point of view.

use crate::controller::UpdateJob;
use crate::watcher::ChangeEvent;
use parking_lot::Mutex;

pub type UpdateAppliedCallback = Box<dyn Fn(&UpdateJob) + Send + Sync>;
pub type FileChangedCallback = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    on_update_applied: Mutex<Vec<UpdateAppliedCallback>>,
    on_file_changed: Mutex<Vec<FileChangedCallback>>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("on_update_applied", &self.on_update_applied.lock().len())
            .field("on_file_changed", &self.on_file_changed.lock().len())
            .finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_on_update_applied(&self, callback: UpdateAppliedCallback) {
        self.on_update_applied.lock().push(callback);
    }

    pub fn register_on_file_changed(&self, callback: FileChangedCallback) {
        self.on_file_changed.lock().push(callback);
    }

    pub fn notify_update_applied(&self, job: &UpdateJob) {
        for callback in self.on_update_applied.lock().iter() {
            callback(job);
        }
    }

    pub fn notify_file_changed(&self, event: &ChangeEvent) {
        for callback in self.on_file_changed.lock().iter() {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChangeKind;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_file_changed_callbacks_run_in_order() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.register_on_file_changed(Box::new(move |_| {
                order.lock().push(tag);
            }));
        }

        let event = ChangeEvent {
            path: PathBuf::from("/app/main.py"),
            kind: ChangeKind::Modified,
            observed_at: Utc::now(),
        };
        registry.notify_file_changed(&event);

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_update_applied_callback_receives_job() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        registry.register_on_update_applied(Box::new(move |job| {
            assert_eq!(job.to_revision.as_deref(), Some("r2"));
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let job = UpdateJob::started(7, Some("r1".to_string()), Some("r2".to_string()));
        registry.notify_update_applied(&job);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_registry_is_a_no_op() {
        let registry = CallbackRegistry::new();
        let event = ChangeEvent {
            path: PathBuf::from("x.py"),
            kind: ChangeKind::Created,
            observed_at: Utc::now(),
        };
        registry.notify_file_changed(&event);
    }
}
