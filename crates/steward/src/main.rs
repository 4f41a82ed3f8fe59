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

//! Steward entry point
//!
//! Runs as the long-lived parent of the worker process: starts it, keeps
//! it alive through the crash watcher, polls the remote for new revisions,
//! and feeds file-change events to the hot-reload coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use steward::callbacks::CallbackRegistry;
use steward::config::load_config;
use steward::controller::UpdateController;
use steward::hotreload::HotReloadCoordinator;
use steward::process::ProcessSupervisor;
use steward::watcher::FileWatcher;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "/data/steward/steward.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("steward=debug".parse()?),
        )
        .init();

    info!("Starting steward");

    let config_path = std::env::var("STEWARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = load_config(&config_path)?;
    info!(
        "Loaded config from {}: repo={}, auto_update={}, install_dir={}",
        config_path.display(),
        config.remote.repo,
        config.auto_update,
        config.install_dir.display()
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.install_dir).await?;

    // One Notify per task: notify_one stores a permit, so a task that is
    // busy at shutdown time still sees it on its next select
    let crash_shutdown = Arc::new(Notify::new());
    let poll_shutdown = Arc::new(Notify::new());
    let reload_shutdown = Arc::new(Notify::new());

    let supervisor = Arc::new(ProcessSupervisor::new(config.worker.clone())?);
    let registry = Arc::new(CallbackRegistry::new());
    let controller = Arc::new(UpdateController::new(
        &config,
        Arc::clone(&supervisor),
        Arc::clone(&registry),
    )?);
    info!(
        "Current revision: {}",
        controller.current_revision().as_deref().unwrap_or("none")
    );

    let coordinator = Arc::new(HotReloadCoordinator::new(
        &config.install_dir,
        Arc::clone(&registry),
    ));
    let (_watcher, change_rx) = FileWatcher::spawn(
        &[config.install_dir.clone()],
        config.managed.extensions.clone(),
        Duration::from_secs(config.debounce_secs),
    )?;

    supervisor.start().await?;
    info!("Worker started");

    let crash_watcher = tokio::spawn(
        Arc::clone(&supervisor).run_crash_watcher(Arc::clone(&crash_shutdown)),
    );
    let poll_loop = tokio::spawn(
        Arc::clone(&controller).run_poll_loop(Arc::clone(&poll_shutdown)),
    );
    let reload_loop = tokio::spawn(
        Arc::clone(&coordinator).run(change_rx, Arc::clone(&reload_shutdown)),
    );

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received");

    crash_shutdown.notify_one();
    poll_shutdown.notify_one();
    reload_shutdown.notify_one();
    for (name, task) in [
        ("poll loop", poll_loop),
        ("crash watcher", crash_watcher),
        ("hot-reload loop", reload_loop),
    ] {
        if let Err(e) = task.await {
            warn!("{name} did not shut down cleanly: {e}");
        }
    }

    if let Err(e) = supervisor.stop().await {
        error!("Failed to stop worker: {e}");
    }
    info!("Shutting down");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}
