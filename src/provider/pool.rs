//! # Backend Pool
//!
//! Holds one client per loaded backend definition together with the
//! per-backend concurrency limiter shared by every descriptor that uses it.
//! The health loop checks every backend and records transitions.

use crate::observability::metrics;
use crate::provider::{BackendId, BackendRef, HealthStatus, SecretBackend};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// A connected backend and its shared limiter
pub struct BackendHandle {
    pub backend_ref: BackendRef,
    pub client: Arc<dyn SecretBackend>,
    pub limiter: Arc<Semaphore>,
    health: RwLock<HealthStatus>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.backend_ref.id)
            .field("kind", &self.backend_ref.kind())
            .field("available_permits", &self.limiter.available_permits())
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    pub fn new(
        backend_ref: BackendRef,
        client: Arc<dyn SecretBackend>,
        default_concurrency: usize,
    ) -> Self {
        let permits = backend_ref.max_concurrency.unwrap_or(default_concurrency).max(1);
        let health = backend_ref.health;
        Self {
            backend_ref,
            client,
            limiter: Arc::new(Semaphore::new(permits)),
            health: RwLock::new(health),
        }
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.health.read().map_or(HealthStatus::Unknown, |h| *h)
    }

    /// Store a new health value, returning the previous one
    fn set_health(&self, health: HealthStatus) -> HealthStatus {
        match self.health.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, health),
            Err(_poisoned) => HealthStatus::Unknown,
        }
    }

    /// Check the backend once and record the result
    pub async fn check(&self) -> HealthStatus {
        let health = self.client.health_check().await;
        let previous = self.set_health(health);
        let id = &self.backend_ref.id;
        metrics::set_backend_health(id, self.backend_ref.kind(), health);

        if previous != health {
            match health {
                HealthStatus::Healthy => info!(
                    backend = %id,
                    from = previous.as_str(),
                    to = health.as_str(),
                    "Backend health transition"
                ),
                _ => warn!(
                    backend = %id,
                    from = previous.as_str(),
                    to = health.as_str(),
                    "Backend health transition"
                ),
            }
        }
        health
    }
}

/// Connected backends keyed by identity
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: RwLock<HashMap<BackendId, Arc<BackendHandle>>>,
    default_concurrency: usize,
}

impl BackendPool {
    #[must_use]
    pub fn new(default_concurrency: usize) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            default_concurrency,
        }
    }

    /// Register a connected client, replacing any previous handle for the same id
    ///
    /// In-flight passes keep the handle they already hold.
    pub fn insert(
        &self,
        backend_ref: BackendRef,
        client: Arc<dyn SecretBackend>,
    ) -> Arc<BackendHandle> {
        let handle = Arc::new(BackendHandle::new(
            backend_ref,
            client,
            self.default_concurrency,
        ));
        match self.backends.write() {
            Ok(mut backends) => {
                backends.insert(handle.backend_ref.id.clone(), Arc::clone(&handle));
            }
            Err(_poisoned) => error!(
                backend = %handle.backend_ref.id,
                "Backend pool lock poisoned, handle not stored"
            ),
        }
        handle
    }

    /// Whether `backend_ref` differs from what is currently loaded
    #[must_use]
    pub fn needs_reload(&self, backend_ref: &BackendRef) -> bool {
        self.get(&backend_ref.id).is_none_or(|handle| {
            handle.backend_ref.connection != backend_ref.connection
                || handle.backend_ref.max_concurrency != backend_ref.max_concurrency
        })
    }

    pub fn remove(&self, id: &BackendId) -> Option<Arc<BackendHandle>> {
        let removed = self.backends.write().ok()?.remove(id);
        if let Some(handle) = &removed {
            metrics::remove_backend_health(id, handle.backend_ref.kind());
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: &BackendId) -> Option<Arc<BackendHandle>> {
        self.backends.read().ok()?.get(id).cloned()
    }

    #[must_use]
    pub fn handles(&self) -> Vec<Arc<BackendHandle>> {
        self.backends
            .read()
            .map(|backends| backends.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Check every backend concurrently
    pub async fn check_all(&self) -> Vec<(BackendId, HealthStatus)> {
        let handles = self.handles();
        let results = futures::future::join_all(handles.iter().map(|handle| handle.check())).await;
        handles
            .iter()
            .map(|handle| handle.backend_ref.id.clone())
            .zip(results)
            .collect()
    }
}
