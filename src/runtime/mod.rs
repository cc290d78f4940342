//! # Runtime
//!
//! Startup wiring and the long-running tasks of the controller.
//!
//! - `initialization`: builds every component and starts the HTTP server
//! - `watch`: `SecretStore` / `ClusterSecretStore` / `ExternalSecret` watches
//! - `health`: periodic backend health checks
//! - `error_policy`: watch stream error classification

pub mod error_policy;
pub mod health;
pub mod initialization;
pub mod watch;

use anyhow::Result;
use initialization::InitializationResult;
use std::sync::Arc;
use tracing::{error, info, warn};
use watch::WatchContext;

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Run the controller until a shutdown signal or a fatal registry error
///
/// # Errors
/// Returns an error if the controller stopped because the descriptor registry
/// became unusable.
pub async fn run(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        client,
        config,
        scheduler,
        backends,
        status_sink,
        server_state,
        server_handle,
        shutdown,
    } = init;

    let ctx = WatchContext {
        scheduler: scheduler.clone(),
        backends: Arc::clone(&backends),
        status_sink,
        restart_delay: config.watch_restart_delay(),
    };
    let watches = tokio::spawn(watch::run_watches(
        client.clone(),
        config.watch_namespace.clone(),
        ctx,
        shutdown.clone(),
    ));
    let health = tokio::spawn(health::run_health_loop(
        client,
        backends,
        config.health_check_interval(),
        config.field_manager.clone(),
        shutdown.clone(),
    ));

    server_state.set_ready(true);
    info!("Controller ready");

    let stopped = scheduler.stopped();
    let fatal = tokio::select! {
        () = shutdown_signal() => {
            info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
            false
        }
        () = stopped.cancelled() => {
            error!("❌ Scheduler stopped after a fatal error, shutting down");
            true
        }
    };

    server_state.set_ready(false);
    shutdown.cancel();
    scheduler.shutdown().await;

    let tasks = [
        ("watches", watches),
        ("health loop", health),
        ("server", server_handle),
    ];
    for (name, task) in tasks {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!("Controller stopped gracefully");
    if fatal {
        anyhow::bail!("descriptor registry became unusable");
    }
    Ok(())
}
