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

//! Worker process lifecycle
//!
//! Owns the supervised worker process: start with a liveness probe,
//! graceful SIGTERM-then-SIGKILL stop, restart-after-update, and a crash
//! watcher with capped exponential backoff and a rolling-window circuit
//! breaker. State transitions are the only mutator of the worker state.

use crate::config::WorkerConfig;
use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    CrashedRestarting,
    /// Crash loop exhausted or relaunch failed: no further automatic starts
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

#[derive(Debug)]
struct Inner {
    child: Option<Child>,
    state: WorkerState,
    started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    crash_times: Vec<Instant>,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    inner: Mutex<Inner>,
    config: WorkerConfig,
    client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StewardError::Process(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                child: None,
                state: WorkerState::Stopped,
                started_at: None,
                restart_count: 0,
                crash_times: Vec::new(),
            }),
            config,
            client,
        })
    }

    pub fn status(&self) -> WorkerStatus {
        let inner = self.inner.lock();
        WorkerStatus {
            pid: inner.child.as_ref().map(Child::id),
            state: inner.state,
            started_at: inner.started_at,
            restart_count: inner.restart_count,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().child.as_ref().map(Child::id)
    }

    /// Launch the worker and wait for it to become live.
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Stopped {
                return Err(StewardError::AlreadyRunning);
            }
            inner.state = WorkerState::Starting;
        }

        info!("Starting worker: {}", self.config.command);
        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        if let Some(ref dir) = self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.lock().state = WorkerState::Stopped;
                return Err(StewardError::Process(format!(
                    "Failed to start {}: {e}",
                    self.config.command
                )));
            }
        };

        let pid = child.id();
        self.inner.lock().child = Some(child);

        match self.probe_liveness().await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.state = WorkerState::Running;
                inner.started_at = Some(Utc::now());
                info!("Worker is live (PID {pid})");
                Ok(())
            }
            Err(e) => {
                // The probe failed: reap whatever is left and end Stopped
                let child = self.inner.lock().child.take();
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                let mut inner = self.inner.lock();
                inner.state = WorkerState::Stopped;
                inner.started_at = None;
                Err(e)
            }
        }
    }

    /// Process-alive check after a short grace period, plus an optional
    /// HTTP health probe until the startup timeout.
    async fn probe_liveness(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;

        if !self.child_alive() {
            return Err(StewardError::Process(
                "worker exited immediately after launch".to_string(),
            ));
        }

        let Some(ref url) = self.config.health_url else {
            return Ok(());
        };

        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        loop {
            if !self.child_alive() {
                return Err(StewardError::Process(
                    "worker exited during startup".to_string(),
                ));
            }
            if let Ok(response) = self.client.get(url).send().await
                && response.status().is_success()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StewardError::StartupTimeout {
                    timeout_secs: self.config.startup_timeout_secs,
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn child_alive(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the graceful timeout.
    /// Always ends in `Stopped` and never blocks indefinitely.
    pub async fn stop(&self) -> Result<()> {
        let child = {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Stopping;
            inner.child.take()
        };

        if let Some(mut child) = child {
            info!("Stopping worker (PID {})", child.id());
            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);

            let start = Instant::now();
            let graceful = Duration::from_secs(self.config.graceful_timeout_secs);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        info!("Worker stopped gracefully");
                        break;
                    }
                    Ok(None) => {
                        if start.elapsed() >= graceful {
                            warn!("Worker ignored SIGTERM, killing");
                            let _ = child.kill();
                            let _ = child.wait();
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(e) => {
                        warn!("Error waiting for worker: {e}");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.state = WorkerState::Stopped;
        inner.started_at = None;
        Ok(())
    }

    /// Deliberate restart, used after a successful apply
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.start().await
    }

    /// Clear the crash window, e.g. after an operator intervention
    pub fn reset_crash_window(&self) {
        let mut inner = self.inner.lock();
        inner.crash_times.clear();
        if inner.state == WorkerState::Failed {
            inner.state = WorkerState::Stopped;
        }
    }

    /// Watch for unexpected exits while Running and relaunch with capped
    /// exponential backoff. Exceeding the restart cap within the rolling
    /// window ends in `Failed` with no further automatic starts.
    pub async fn run_crash_watcher(self: Arc<Self>, shutdown: Arc<Notify>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Crash watcher shutting down");
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }

            let crashes = {
                let mut inner = self.inner.lock();
                if inner.state != WorkerState::Running {
                    continue;
                }
                let exited = match inner.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            warn!("Worker exited unexpectedly: {status}");
                            true
                        }
                        Ok(None) => false,
                        Err(e) => {
                            warn!("Error polling worker: {e}");
                            true
                        }
                    },
                    None => true,
                };
                if !exited {
                    continue;
                }

                inner.child = None;
                let now = Instant::now();
                let window = Duration::from_secs(self.config.crash_window_secs);
                inner.crash_times.push(now);
                inner.crash_times.retain(|&t| now.duration_since(t) < window);
                let crashes = inner.crash_times.len();

                if crashes > self.config.crash_restart_limit {
                    inner.state = WorkerState::Failed;
                    error!(
                        "FATAL: worker crashed {crashes} times within {}s, giving up",
                        self.config.crash_window_secs
                    );
                    continue;
                }

                inner.state = WorkerState::CrashedRestarting;
                inner.restart_count += 1;
                crashes
            };

            let backoff = self.crash_backoff(crashes);
            warn!(
                "Relaunching worker in {:?} (crash {crashes}/{})",
                backoff, self.config.crash_restart_limit
            );
            tokio::time::sleep(backoff).await;

            {
                let mut inner = self.inner.lock();
                // A deliberate restart may have taken over while we slept;
                // the relaunch then belongs to whoever changed the state
                if inner.state != WorkerState::CrashedRestarting {
                    continue;
                }
                inner.state = WorkerState::Stopped;
            }
            if let Err(e) = self.start().await {
                // A worker that cannot even relaunch is a fatal condition,
                // not something to retry forever
                error!("FATAL: relaunch after crash failed: {e}");
                self.inner.lock().state = WorkerState::Failed;
            }
        }
    }

    fn crash_backoff(&self, crashes: usize) -> Duration {
        let exp = crashes.saturating_sub(1).min(16) as u32;
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}
