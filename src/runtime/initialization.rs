//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, Kubernetes client setup and wiring of the reconciler.

use crate::config::ControllerConfig;
use crate::constants::{SERVER_POLL_INTERVAL_MS, SERVER_STARTUP_TIMEOUT_SECS};
use crate::controller::reconciler::{ExternalSecretStatusSink, Reconciler, StatusSink};
use crate::controller::registry::DescriptorRegistry;
use crate::controller::scheduler::Scheduler;
use crate::crd::ExternalSecret;
use crate::observability;
use crate::provider::pool::BackendPool;
use crate::server::{start_server, ServerState};
use crate::store::kubernetes::KubernetesSecretStore;
use crate::store::StoreAdapter;
use anyhow::{Context, Result};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    pub client: Client,
    pub config: ControllerConfig,
    pub scheduler: Scheduler,
    pub backends: Arc<BackendPool>,
    pub status_sink: Arc<dyn StatusSink>,
    pub server_state: Arc<ServerState>,
    pub server_handle: JoinHandle<()>,
    /// Cancelled on shutdown; stops the server, watches and health loop
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("config", &self.config)
            .field(
                "server_ready",
                &self.server_state.is_ready.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Registry, backend pool, store adapter, reconciler and scheduler setup
///
/// # Errors
/// Returns an error if tracing or metrics cannot be initialized, the HTTP
/// server does not come up or no Kubernetes client can be built.
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before any TLS client is built
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    let config = ControllerConfig::from_env();
    observability::logging::init_tracing(&config)?;
    if !provider_installed {
        debug!("rustls crypto provider was already installed");
    }

    info!("Starting Secret Sync Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    debug!(config = ?config, "Loaded controller configuration");

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let shutdown = CancellationToken::new();

    let server_handle = {
        let state = Arc::clone(&server_state);
        let port = config.metrics_port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_server(port, state, shutdown).await {
                error!("HTTP server error: {}", e);
            }
        })
    };
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let registry = Arc::new(DescriptorRegistry::new(config.min_refresh_interval()));
    let backends = Arc::new(BackendPool::new(config.default_backend_concurrency));
    let store: Arc<dyn StoreAdapter> = Arc::new(KubernetesSecretStore::new(
        client.clone(),
        config.field_manager.clone(),
    ));
    let status_sink: Arc<dyn StatusSink> = Arc::new(ExternalSecretStatusSink::new(
        client.clone(),
        config.field_manager.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        registry,
        Arc::clone(&backends),
        store,
        Arc::clone(&status_sink),
        config.reconcile_settings(),
    ));
    let scheduler = Scheduler::new(reconciler);
    scheduler.start(config.max_concurrent_reconciliations);

    log_startup_summary(&client, config.watch_namespace.as_deref()).await;

    info!("Controller initialized, starting watches...");

    Ok(InitializationResult {
        client,
        config,
        scheduler,
        backends,
        status_sink,
        server_state,
        server_handle,
        shutdown,
    })
}

/// Wait for the HTTP server to bind
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(SERVER_STARTUP_TIMEOUT_SECS);
    let poll_interval = Duration::from_millis(SERVER_POLL_INTERVAL_MS);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_listening.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Log the `ExternalSecret`s present at startup, grouped by namespace
///
/// The watches pick every one of them up in their initial list; this only
/// checks the CRD is queryable and gives operators a summary.
async fn log_startup_summary(client: &Client, namespace: Option<&str>) {
    let api: Api<ExternalSecret> = match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let list = match api.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            error!("ExternalSecret CRD is not queryable; {:?}. Is the CRD installed?", e);
            warn!("Continuing despite CRD queryability check failure - watches will retry");
            return;
        }
    };

    if list.items.is_empty() {
        info!("No existing ExternalSecret resources found, watch will pick up new resources");
        return;
    }

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in &list.items {
        by_namespace
            .entry(item.namespace().unwrap_or_default())
            .or_default()
            .push(item.name_any());
    }

    info!("Secret Sync Controller - Startup Resource Summary");
    info!("Total ExternalSecrets: {}", list.items.len());
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, mut names) in by_namespace {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), shown);
    }
}
