//! # Watch Loops
//!
//! Keeps the backend pool and the descriptor registry in step with the
//! `SecretStore`, `ClusterSecretStore` and `ExternalSecret` resources.
//!
//! Each watch relists on (re)start. Objects that were not seen in the relist
//! are treated as deleted, so removals that happened while the stream was
//! down still clean up.

use crate::constants::{WATCH_BACKOFF_MAX_MS, WATCH_BACKOFF_START_MS};
use crate::controller::descriptor::{DescriptorStatus, ObjectIdentity, SyncStatus};
use crate::controller::registry::RegistryError;
use crate::controller::reconciler::StatusSink;
use crate::controller::scheduler::Scheduler;
use crate::crd::{ClusterSecretStore, ExternalSecret, SecretStore};
use crate::provider::pool::BackendPool;
use crate::provider::{self, BackendId, BackendRef, BackendScope};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error_policy::handle_watch_stream_error;

/// Reason published on an `ExternalSecret` that cannot be turned into a descriptor
const INVALID_DESCRIPTOR_REASON: &str = "InvalidDescriptor";

/// Shared handles for the watch handlers
#[derive(Clone)]
pub struct WatchContext {
    pub scheduler: Scheduler,
    pub backends: Arc<BackendPool>,
    pub status_sink: Arc<dyn StatusSink>,
    pub restart_delay: Duration,
}

impl Debug for WatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchContext")
            .field("scheduler", &self.scheduler)
            .field("backends", &self.backends)
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

/// A custom resource that defines a backend
pub trait BackendSource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    fn backend_id(&self) -> BackendId;

    /// # Errors
    /// Returns an error if the provider block is invalid.
    fn to_backend_ref(&self) -> anyhow::Result<BackendRef>;

    /// Whether a pool entry comes from this resource kind
    fn owns(id: &BackendId) -> bool;
}

impl BackendSource for SecretStore {
    fn backend_id(&self) -> BackendId {
        SecretStore::backend_id(self)
    }

    fn to_backend_ref(&self) -> anyhow::Result<BackendRef> {
        SecretStore::to_backend_ref(self)
    }

    fn owns(id: &BackendId) -> bool {
        matches!(id.scope, BackendScope::Namespaced(_))
    }
}

impl BackendSource for ClusterSecretStore {
    fn backend_id(&self) -> BackendId {
        ClusterSecretStore::backend_id(self)
    }

    fn to_backend_ref(&self) -> anyhow::Result<BackendRef> {
        ClusterSecretStore::to_backend_ref(self)
    }

    fn owns(id: &BackendId) -> bool {
        id.scope == BackendScope::Cluster
    }
}

#[async_trait]
trait WatchHandler<K: Send + 'static>: Send {
    async fn on_event(&mut self, event: watcher::Event<K>);
}

/// Connect a backend definition into the pool and wake its descriptors
///
/// A definition whose connection parameters did not change keeps its client
/// and limiter.
pub async fn load_backend<S: BackendSource>(ctx: &WatchContext, source: &S) {
    let backend_ref = match source.to_backend_ref() {
        Ok(backend_ref) => backend_ref,
        Err(e) => {
            warn!(backend = %source.backend_id(), error = %e, "Invalid backend definition");
            return;
        }
    };

    if !ctx.backends.needs_reload(&backend_ref) {
        debug!(backend = %backend_ref.id, "Backend definition unchanged");
        return;
    }

    let client = match provider::connect(&backend_ref).await {
        Ok(client) => client,
        Err(e) => {
            error!(backend = %backend_ref.id, error = %e, "❌ Failed to connect backend");
            return;
        }
    };

    let id = backend_ref.id.clone();
    let kind = backend_ref.kind();
    ctx.backends.insert(backend_ref, client);
    info!(backend = %id, kind = kind.as_str(), "✅ Backend loaded");

    match ctx.scheduler.reconciler().registry().ids_for_backend(&id) {
        Ok(ids) => {
            for descriptor in &ids {
                ctx.scheduler.trigger(descriptor);
            }
        }
        Err(e) => fatal(ctx, &e),
    }
}

/// Drop a backend from the pool
///
/// Descriptors referencing it fail with `BackendNotReady` until it returns.
pub fn unload_backend(ctx: &WatchContext, id: &BackendId) {
    if ctx.backends.remove(id).is_some() {
        info!(backend = %id, "🗑️ Backend unloaded");
    }
}

/// Register or update the descriptor behind an `ExternalSecret`
pub async fn apply_external_secret(ctx: &WatchContext, external_secret: &ExternalSecret) {
    let descriptor = match external_secret.to_descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            reject(ctx, external_secret, &format!("{e:#}")).await;
            return;
        }
    };

    let id = descriptor.id.clone();
    match ctx.scheduler.apply_descriptor(descriptor) {
        Ok(change) => debug!(descriptor = %id, change = ?change, "Descriptor applied"),
        Err(RegistryError::Invalid(e)) => reject(ctx, external_secret, &e.to_string()).await,
        Err(e) => fatal(ctx, &e),
    }
}

/// Forget the descriptor behind a deleted `ExternalSecret`
///
/// The descriptor leaves the registry before this returns. Waiting for its
/// in-flight pass and cleaning up the destination run on a separate task so
/// the event stream keeps moving; the handle is returned for callers that
/// need to wait.
pub fn delete_external_secret(ctx: &WatchContext, id: &ObjectIdentity) -> Option<JoinHandle<()>> {
    match ctx.scheduler.detach(id) {
        Ok(Some(removal)) => Some(tokio::spawn(async move {
            debug!(descriptor = %removal.id(), "Cleaning up removed descriptor");
            removal.finish().await;
        })),
        Ok(None) => None,
        Err(e) => {
            fatal(ctx, &e);
            None
        }
    }
}

async fn reject(ctx: &WatchContext, external_secret: &ExternalSecret, message: &str) {
    let namespace = external_secret.namespace().unwrap_or_default();
    let id = ObjectIdentity::new(namespace, external_secret.name_any());
    warn!(descriptor = %id, error = %message, "Rejected ExternalSecret");

    let status = DescriptorStatus {
        last_sync_status: SyncStatus::Error,
        last_error_reason: Some(INVALID_DESCRIPTOR_REASON.to_string()),
        last_error: Some(message.to_string()),
        ..DescriptorStatus::default()
    };
    if let Err(e) = ctx.status_sink.publish(&id, &status).await {
        warn!(descriptor = %id, error = %e, "Failed to publish status");
    }
}

fn fatal(ctx: &WatchContext, error: &RegistryError) {
    error!(error = %error, "❌ Descriptor registry failure, stopping controller");
    ctx.scheduler.stopped().cancel();
}

struct StoreHandler<S> {
    ctx: WatchContext,
    seen: HashSet<BackendId>,
    _kind: PhantomData<fn() -> S>,
}

impl<S: BackendSource> StoreHandler<S> {
    fn new(ctx: WatchContext) -> Self {
        Self {
            ctx,
            seen: HashSet::new(),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<S: BackendSource> WatchHandler<S> for StoreHandler<S> {
    async fn on_event(&mut self, event: watcher::Event<S>) {
        match event {
            watcher::Event::Apply(source) => load_backend(&self.ctx, &source).await,
            watcher::Event::Delete(source) => unload_backend(&self.ctx, &source.backend_id()),
            watcher::Event::Init => self.seen.clear(),
            watcher::Event::InitApply(source) => {
                self.seen.insert(source.backend_id());
                load_backend(&self.ctx, &source).await;
            }
            watcher::Event::InitDone => {
                for handle in self.ctx.backends.handles() {
                    let id = &handle.backend_ref.id;
                    if S::owns(id) && !self.seen.contains(id) {
                        unload_backend(&self.ctx, id);
                    }
                }
                self.seen.clear();
            }
        }
    }
}

struct ExternalSecretHandler {
    ctx: WatchContext,
    seen: HashSet<ObjectIdentity>,
}

#[async_trait]
impl WatchHandler<ExternalSecret> for ExternalSecretHandler {
    async fn on_event(&mut self, event: watcher::Event<ExternalSecret>) {
        match event {
            watcher::Event::Apply(external_secret) => {
                apply_external_secret(&self.ctx, &external_secret).await;
            }
            watcher::Event::Delete(external_secret) => {
                if let Ok(id) = external_secret.identity() {
                    delete_external_secret(&self.ctx, &id);
                }
            }
            watcher::Event::Init => self.seen.clear(),
            watcher::Event::InitApply(external_secret) => {
                if let Ok(id) = external_secret.identity() {
                    self.seen.insert(id);
                }
                apply_external_secret(&self.ctx, &external_secret).await;
            }
            watcher::Event::InitDone => {
                let registered = match self.ctx.scheduler.reconciler().registry().ids() {
                    Ok(ids) => ids,
                    Err(e) => return fatal(&self.ctx, &e),
                };
                for id in registered.iter().filter(|id| !self.seen.contains(*id)) {
                    info!(descriptor = %id, "ExternalSecret disappeared while the watch was down");
                    delete_external_secret(&self.ctx, id);
                }
                self.seen.clear();
            }
        }
    }
}

/// Consume one resource's watch until `shutdown`, restarting the stream on errors
async fn run_watch<K, H>(
    api: Api<K>,
    handler: &mut H,
    restart_delay: Duration,
    shutdown: &CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    H: WatchHandler<K>,
{
    let resource = K::kind(&()).to_string();
    let backoff_ms = AtomicU64::new(WATCH_BACKOFF_START_MS);

    loop {
        info!(resource = resource.as_str(), "Starting watch");

        let stream =
            watcher(api.clone(), watcher::Config::default().any_semantic()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => {
                    info!(resource = resource.as_str(), "Watch stopped");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    backoff_ms.store(WATCH_BACKOFF_START_MS, Ordering::Relaxed);
                    handler.on_event(event).await;
                }
                Some(Err(e)) => {
                    let restart = handle_watch_stream_error(
                        &resource,
                        &format!("{e:?}"),
                        &backoff_ms,
                        WATCH_BACKOFF_MAX_MS,
                        restart_delay,
                    )
                    .await;
                    if restart {
                        break;
                    }
                }
                None => {
                    warn!(
                        resource = resource.as_str(),
                        delay_secs = restart_delay.as_secs(),
                        "Watch stream ended, restarting"
                    );
                    crate::observability::metrics::increment_watch_restarts(&resource);
                    tokio::time::sleep(restart_delay).await;
                    break;
                }
            }
        }
    }
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Run the store and `ExternalSecret` watches until `shutdown`
pub async fn run_watches(
    client: Client,
    watch_namespace: Option<String>,
    ctx: WatchContext,
    shutdown: CancellationToken,
) {
    let namespace = watch_namespace.as_deref();
    let restart_delay = ctx.restart_delay;

    let mut stores = StoreHandler::<SecretStore>::new(ctx.clone());
    let mut cluster_stores = StoreHandler::<ClusterSecretStore>::new(ctx.clone());
    let mut external_secrets = ExternalSecretHandler {
        ctx,
        seen: HashSet::new(),
    };

    tokio::join!(
        run_watch(
            scoped::<SecretStore>(client.clone(), namespace),
            &mut stores,
            restart_delay,
            &shutdown,
        ),
        run_watch(
            Api::<ClusterSecretStore>::all(client.clone()),
            &mut cluster_stores,
            restart_delay,
            &shutdown,
        ),
        run_watch(
            scoped::<ExternalSecret>(client, namespace),
            &mut external_secrets,
            restart_delay,
            &shutdown,
        ),
    );
    info!("All watches stopped");
}
