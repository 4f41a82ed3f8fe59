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

//! Update orchestration
//!
//! The controller runs the poll loop against the revision source and
//! drives fetch, apply, and restart on a detected new revision. At most
//! one update job is ever in flight; the job-start transition is the one
//! guarded shared-mutable-state contention point, since the poll loop,
//! the admin surface, and future triggers may all race to start one.

use crate::applier::UpdateApplier;
use crate::callbacks::CallbackRegistry;
use crate::config::StewardConfig;
use crate::error::{Result, StewardError};
use crate::fetcher::UpdateFetcher;
use crate::manifest::ManagedFileSet;
use crate::process::{ProcessSupervisor, WorkerState};
use crate::revision::{RevisionPointer, RevisionSource};
use crate::snapshot::Snapshotter;
use crate::state::{ControllerState, load_state, save_state};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Checking,
    Fetching,
    Applying,
    Restarting,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One attempt to move the installation from one revision to another
#[derive(Debug, Clone, Serialize)]
pub struct UpdateJob {
    pub job_id: u64,
    pub from_revision: Option<String>,
    pub to_revision: Option<String>,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl UpdateJob {
    pub fn started(job_id: u64, from_revision: Option<String>, to_revision: Option<String>) -> Self {
        Self {
            job_id,
            from_revision,
            to_revision,
            state: JobState::Checking,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

/// Snapshot of the controller for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub current_revision: Option<String>,
    pub auto_update_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub active_job: Option<UpdateJob>,
    pub worker: WorkerState,
}

#[derive(Debug)]
struct Inner {
    active: Option<UpdateJob>,
    history: VecDeque<UpdateJob>,
    next_job_id: u64,
    state: ControllerState,
}

pub struct UpdateController {
    inner: Mutex<Inner>,
    source: RevisionSource,
    fetcher: UpdateFetcher,
    applier: UpdateApplier,
    snapshotter: Snapshotter,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<CallbackRegistry>,
    state_path: PathBuf,
    check_interval: Mutex<Duration>,
    confirm_after: Duration,
    history_limit: usize,
}

impl std::fmt::Debug for UpdateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateController")
            .field("state_path", &self.state_path)
            .finish()
    }
}

impl UpdateController {
    pub fn new(
        config: &StewardConfig,
        supervisor: Arc<ProcessSupervisor>,
        registry: Arc<CallbackRegistry>,
    ) -> Result<Self> {
        let managed = ManagedFileSet::new(
            &config.install_dir,
            config.managed.extensions.clone(),
            config.managed.deny.clone(),
        );
        let source = RevisionSource::new(config.remote.clone())?;
        let fetcher = UpdateFetcher::new(config.remote.clone(), config.staging_dir())?;
        let applier = UpdateApplier::new(managed.clone());
        let snapshotter = Snapshotter::new(config.snapshots_dir(), managed, config.snapshot_retain);

        let state_path = config.state_path();
        let first_boot = !state_path.exists();
        let mut state = load_state(&state_path)?;
        // Config seeds the enable flag on first boot; afterwards the
        // persisted operator choice wins
        if first_boot {
            state.auto_update_enabled = config.auto_update;
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                active: None,
                history: VecDeque::new(),
                next_job_id: 1,
                state,
            }),
            source,
            fetcher,
            applier,
            snapshotter,
            supervisor,
            registry,
            state_path,
            check_interval: Mutex::new(Duration::from_secs(config.check_interval_secs)),
            confirm_after: Duration::from_secs(config.snapshot_confirm_secs),
            history_limit: config.job_history_limit,
        })
    }

    pub fn status(&self) -> ControllerStatus {
        let inner = self.inner.lock();
        ControllerStatus {
            current_revision: inner.state.current_revision.clone(),
            auto_update_enabled: inner.state.auto_update_enabled,
            last_check: inner.state.last_check_at,
            active_job: inner.active.clone(),
            worker: self.supervisor.state(),
        }
    }

    pub fn current_revision(&self) -> Option<String> {
        self.inner.lock().state.current_revision.clone()
    }

    pub fn auto_update_enabled(&self) -> bool {
        self.inner.lock().state.auto_update_enabled
    }

    pub fn toggle_auto_update(&self, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.auto_update_enabled = enabled;
        save_state(&self.state_path, &inner.state)?;
        info!("Auto-update {}", if enabled { "enabled" } else { "paused" });
        Ok(())
    }

    pub fn set_check_interval(&self, secs: u64) {
        *self.check_interval.lock() = Duration::from_secs(secs.max(1));
    }

    pub fn job_history(&self) -> Vec<UpdateJob> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// The one guarded transition: reject when a non-terminal job exists.
    fn begin_job(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.active.is_some() {
            return Err(StewardError::Busy);
        }
        let job_id = inner.next_job_id;
        inner.next_job_id += 1;
        let from = inner.state.current_revision.clone();
        inner.active = Some(UpdateJob::started(job_id, from, None));
        Ok(job_id)
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut UpdateJob) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.active.as_mut().map(f)
    }

    fn finish_job(&self, state: JobState, error: Option<String>) {
        let mut inner = self.inner.lock();
        if let Some(mut job) = inner.active.take() {
            job.state = state;
            job.finished_at = Some(Utc::now());
            job.error = error;
            inner.history.push_back(job);
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }
        }
    }

    /// Manual trigger, regardless of the poll timer.
    /// Rejected with `Busy` while a job is in flight; an in-flight job is
    /// never cancelled, partial applies must reach a safe terminal state.
    pub fn force_update(self: &Arc<Self>) -> Result<u64> {
        let job_id = self.begin_job()?;
        info!("Manual update check requested (job {job_id})");
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run_job(job_id).await;
        });
        Ok(job_id)
    }

    /// Poll loop: tick, confirm pending snapshots, check for updates.
    pub async fn run_poll_loop(self: Arc<Self>, shutdown: Arc<Notify>) {
        loop {
            let interval = *self.check_interval.lock();
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Update poll loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            self.poll_once().await;
        }
    }

    /// One scheduled tick. A job record is materialized only when a new
    /// revision is actually found; no-change checks and transient check
    /// failures leave no trace in the job history.
    async fn poll_once(&self) {
        self.maybe_confirm_snapshot();

        if !self.auto_update_enabled() {
            return;
        }
        // A worker in the crash-loop terminal state needs an operator
        // before any further updates land on it
        if self.supervisor.state() == WorkerState::Failed {
            warn!("Worker is in the failed state, skipping update check");
            return;
        }

        self.record_check();
        let candidate = match self.source.get_latest().await {
            Ok(candidate) => candidate,
            Err(e) => {
                // Transient: the next scheduled poll is the retry
                warn!("Revision check failed: {e}");
                return;
            }
        };
        if self.current_revision().as_deref() == Some(candidate.id.as_str()) {
            debug!("Already on revision {}", candidate.id);
            return;
        }

        // Admission only fails when another job is already in flight
        let Ok(job_id) = self.begin_job() else {
            return;
        };
        self.execute_job(job_id, candidate).await;
    }

    /// Drive one manually requested job to a terminal state. The record
    /// already exists; even a no-change outcome is archived so the
    /// operator sees the result of their request.
    pub async fn run_job(&self, job_id: u64) {
        info!("Update job {job_id}: checking for a new revision");
        self.record_check();

        let candidate = match self.source.get_latest().await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Job {job_id}: revision check failed: {e}");
                self.finish_job(JobState::Failed, Some(e.to_string()));
                return;
            }
        };

        if self.current_revision().as_deref() == Some(candidate.id.as_str()) {
            info!("Job {job_id}: already on revision {}", candidate.id);
            self.with_active(|job| job.to_revision = Some(candidate.id.clone()));
            self.finish_job(JobState::Succeeded, None);
            return;
        }

        self.execute_job(job_id, candidate).await;
    }

    fn record_check(&self) {
        let mut inner = self.inner.lock();
        inner.state.last_check_at = Some(Utc::now());
        if let Err(e) = save_state(&self.state_path, &inner.state) {
            warn!("Failed to persist state: {e}");
        }
    }

    /// Fetch, apply, and restart for a known new revision.
    async fn execute_job(&self, job_id: u64, candidate: RevisionPointer) {
        info!(
            "Job {job_id}: new revision {} ({}), current {:?}",
            candidate.id,
            candidate.message,
            self.current_revision()
        );
        self.with_active(|job| {
            job.to_revision = Some(candidate.id.clone());
            job.state = JobState::Fetching;
        });

        match self.run_transition(job_id, &candidate).await {
            Ok(()) => {
                info!("Job {job_id}: updated to revision {}", candidate.id);
                self.finish_job(JobState::Succeeded, None);
            }
            Err(e) => {
                if e.is_fatal() {
                    error!("FATAL: job {job_id} failed unsafely, pausing auto-update: {e}");
                    if let Err(toggle_err) = self.toggle_auto_update(false) {
                        error!("Also failed to persist the pause: {toggle_err}");
                    }
                } else {
                    warn!("Job {job_id} failed: {e}");
                }
                self.finish_job(JobState::Failed, Some(e.to_string()));
            }
        }
    }

    async fn run_transition(&self, job_id: u64, candidate: &RevisionPointer) -> Result<()> {
        let staging = self.fetcher.fetch(candidate).await?;

        self.with_active(|job| job.state = JobState::Applying);
        let snapshot = self.applier.apply(&staging, &self.snapshotter)?;

        // The web layer and notification transports learn about the apply
        // before the worker comes back up
        if let Some(job) = self.inner.lock().active.clone() {
            self.registry.notify_update_applied(&job);
        }

        self.with_active(|job| job.state = JobState::Restarting);
        if let Err(restart_err) = self.supervisor.restart().await {
            warn!(
                "Job {job_id}: restart on revision {} failed: {restart_err}; rolling back",
                candidate.id
            );
            self.snapshotter.restore_snapshot(&snapshot.snapshot_id)?;
            // Files are reverted but the worker is down: fatal, needs an
            // operator
            self.supervisor.restart().await.map_err(|retry_err| {
                error!("FATAL: restart failed even after rollback: {retry_err}");
                StewardError::Apply {
                    rolled_back: false,
                    reason: format!(
                        "files reverted but the worker did not come back: {retry_err}"
                    ),
                }
            })?;
            // Previous revision is running again; the job itself failed
            return Err(StewardError::Apply {
                rolled_back: true,
                reason: format!("restart failed: {restart_err}"),
            });
        }

        {
            let mut inner = self.inner.lock();
            inner.state.current_revision = Some(candidate.id.clone());
            inner.state.last_update_at = Some(Utc::now());
            inner.state.pending_confirm_snapshot = Some(snapshot.snapshot_id.clone());
            save_state(&self.state_path, &inner.state)?;
        }

        // Staging is ephemeral
        let _ = std::fs::remove_dir_all(&staging.dir);
        Ok(())
    }

    /// Confirm the pending pre-update snapshot once the new revision has
    /// run stably for the grace period, then prune old snapshots.
    fn maybe_confirm_snapshot(&self) {
        let confirmed = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.state.pending_confirm_snapshot.clone() else {
                return;
            };
            let Some(updated_at) = inner.state.last_update_at else {
                return;
            };
            let stable_for = Utc::now().signed_duration_since(updated_at);
            if stable_for.num_seconds() < self.confirm_after.as_secs() as i64 {
                return;
            }
            if self.supervisor.state() != WorkerState::Running {
                return;
            }

            inner.state.confirmed_snapshot = Some(pending.clone());
            inner.state.pending_confirm_snapshot = None;
            if let Err(e) = save_state(&self.state_path, &inner.state) {
                warn!("Failed to persist snapshot confirmation: {e}");
            }
            pending
        };

        info!("Snapshot {confirmed} confirmed good after stable operation");
        if let Err(e) = self.snapshotter.prune(Some(&confirmed)) {
            warn!("Snapshot pruning failed: {e}");
        }
    }
}
