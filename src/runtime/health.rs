//! # Backend Health Loop
//!
//! Checks every loaded backend on a fixed period and writes the result to the
//! status of the store resource that defined it.

use crate::crd::{ClusterSecretStore, SecretStore, SecretStoreStatus};
use crate::provider::pool::BackendPool;
use crate::provider::{BackendId, BackendScope, HealthStatus};
use anyhow::Result;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn store_status(health: HealthStatus) -> SecretStoreStatus {
    SecretStoreStatus {
        health: Some(health.as_str().to_string()),
        last_checked: Some(chrono::Utc::now().to_rfc3339()),
        message: (health == HealthStatus::Unreachable)
            .then(|| "Backend health check failed".to_string()),
    }
}

async fn publish_store_health(
    client: &Client,
    id: &BackendId,
    health: HealthStatus,
    field_manager: &str,
) -> Result<()> {
    let patch = serde_json::json!({ "status": store_status(health) });
    let params = PatchParams::apply(field_manager);
    match &id.scope {
        BackendScope::Namespaced(namespace) => {
            let api: Api<SecretStore> = Api::namespaced(client.clone(), namespace);
            api.patch_status(&id.name, &params, &Patch::Merge(&patch))
                .await?;
        }
        BackendScope::Cluster => {
            let api: Api<ClusterSecretStore> = Api::all(client.clone());
            api.patch_status(&id.name, &params, &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

/// Check all backends every `interval` until `shutdown`
pub async fn run_health_loop(
    client: Client,
    backends: Arc<BackendPool>,
    interval: Duration,
    field_manager: String,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for (id, health) in backends.check_all().await {
            if let Err(e) = publish_store_health(&client, &id, health, &field_manager).await {
                debug!(backend = %id, error = %e, "Failed to publish backend health");
            }
        }
    }
    info!("Health loop stopped");
}
