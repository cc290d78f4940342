//! # Reconciler
//!
//! The reconciliation engine: one pass drives a descriptor through
//! Fetching -> Rendering -> Diffing -> Applying -> Synced, or into Error.
//!
//! ## Pass Flow
//!
//! 1. Resolve every remote value (concurrently, under the backend's limiter)
//! 2. Render the template, or use the resolved values directly
//! 3. Compare the payload's content hash with the one recorded on the
//!    destination object
//! 4. Create or update the object, honouring the creation policy and the
//!    owner marker; a concurrency conflict is retried once
//! 5. Record the outcome, update metrics and publish status
//!
//! A failure at any step aborts the pass before anything is written.
//! Failures are retried after a per-descriptor exponential backoff; success
//! resets it and schedules the next pass after the refresh interval.
//!
//! Cancellation is checked between phases. A cancelled pass records nothing.

mod apply;
pub mod cleanup;
mod fetch;
pub mod status;
pub mod types;

pub use cleanup::cleanup_target;
pub use status::{ExternalSecretStatusSink, NoopStatusSink, StatusSink};
pub use types::{PassOutcome, PassReport, ReconcileSettings, SyncError};

use crate::constants::DEFAULT_SECRET_TYPE;
use crate::controller::backoff::BackoffState;
use crate::controller::descriptor::{CreationPolicy, ObjectIdentity, SecretDescriptor, SyncPhase};
use crate::controller::payload::{RenderedPayload, ResolvedFields, WriteMode};
use crate::controller::registry::{DescriptorRegistry, Outcome, RegistryError};
use crate::controller::template;
use crate::observability::metrics;
use crate::provider::pool::BackendPool;
use crate::store::{StoreAdapter, StoreError};
use apply::WritePlan;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Internal failure of a pass: either recorded on the descriptor, or fatal
#[derive(Debug)]
enum PassFailure {
    Sync(SyncError),
    Fatal(RegistryError),
}

impl From<SyncError> for PassFailure {
    fn from(e: SyncError) -> Self {
        PassFailure::Sync(e)
    }
}

impl From<RegistryError> for PassFailure {
    fn from(e: RegistryError) -> Self {
        PassFailure::Fatal(e)
    }
}

/// Shared context for every reconciliation pass
pub struct Reconciler {
    registry: Arc<DescriptorRegistry>,
    backends: Arc<BackendPool>,
    store: Arc<dyn StoreAdapter>,
    status_sink: Arc<dyn StatusSink>,
    settings: ReconcileSettings,
    backoff_states: Mutex<HashMap<ObjectIdentity, BackoffState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        registry: Arc<DescriptorRegistry>,
        backends: Arc<BackendPool>,
        store: Arc<dyn StoreAdapter>,
        status_sink: Arc<dyn StatusSink>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            registry,
            backends,
            store,
            status_sink,
            settings,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn backends(&self) -> &Arc<BackendPool> {
        &self.backends
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    #[must_use]
    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Drop the backoff state of a removed descriptor
    pub fn forget(&self, id: &ObjectIdentity) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(id);
        }
    }

    fn record_backoff(&self, id: &ObjectIdentity) -> std::time::Duration {
        let Ok(mut states) = self.backoff_states.lock() else {
            return self.settings.backoff_max;
        };
        states
            .entry(id.clone())
            .or_insert_with(|| BackoffState::new(self.settings.backoff_base, self.settings.backoff_max))
            .record_failure()
    }

    fn reset_backoff(&self, id: &ObjectIdentity) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(id) {
                state.reset();
            }
        }
    }

    /// Run one pass for `id`
    ///
    /// Sync failures are recorded on the descriptor and reported in the
    /// returned [`PassReport`]; they are never returned as errors.
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the registry can no longer be trusted.
    pub async fn reconcile(
        &self,
        id: &ObjectIdentity,
        cancel: &CancellationToken,
    ) -> Result<PassReport, RegistryError> {
        let span = info_span!("reconcile", descriptor = %id);
        self.reconcile_inner(id, cancel).instrument(span).await
    }

    async fn reconcile_inner(
        &self,
        id: &ObjectIdentity,
        cancel: &CancellationToken,
    ) -> Result<PassReport, RegistryError> {
        let cancelled = PassReport {
            result: Err(SyncError::Cancelled),
            next_delay: None,
        };
        let Some(descriptor) = self.registry.get(id)? else {
            debug!("Descriptor is no longer registered, skipping pass");
            return Ok(cancelled);
        };
        if cancel.is_cancelled() || !self.registry.begin_pass(id)? {
            return Ok(cancelled);
        }

        let start = Instant::now();
        let pass_timeout = self.settings.pass_timeout;
        let result = match tokio::time::timeout(pass_timeout, self.run_pass(&descriptor, cancel)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(PassFailure::Sync(SyncError::Timeout {
                stage: "pass",
                after: pass_timeout,
            })),
        };
        let elapsed = start.elapsed().as_secs_f64();

        let (report, outcome) = match result {
            Ok((outcome, content_hash)) => {
                self.reset_backoff(id);
                metrics::record_sync_success(id, elapsed);
                info!(
                    target_secret = %descriptor.target,
                    outcome = outcome.as_str(),
                    content_hash = %content_hash,
                    duration_secs = elapsed,
                    "✅ Secret synced"
                );
                (
                    PassReport {
                        result: Ok(outcome),
                        next_delay: Some(descriptor.refresh_interval),
                    },
                    Outcome::Synced {
                        at: Utc::now(),
                        content_hash,
                    },
                )
            }
            Err(PassFailure::Fatal(e)) => {
                error!(error = %e, "Descriptor registry failure");
                return Err(e);
            }
            Err(PassFailure::Sync(SyncError::Cancelled)) => {
                debug!("Pass cancelled");
                return Ok(cancelled);
            }
            Err(PassFailure::Sync(e)) => {
                let delay = self.record_backoff(id);
                metrics::record_sync_failure(id, e.reason(), elapsed);
                log_failure(&descriptor, &e, delay);
                let outcome = Outcome::Failed {
                    reason: e.reason(),
                    message: e.to_string(),
                };
                (
                    PassReport {
                        result: Err(e),
                        next_delay: Some(delay),
                    },
                    outcome,
                )
            }
        };

        let Some(status) = self.registry.record_outcome(id, outcome)? else {
            debug!("Descriptor removed during the pass");
            return Ok(PassReport {
                next_delay: None,
                ..report
            });
        };
        if let Err(e) = self.status_sink.publish(id, &status).await {
            warn!(error = %e, "Failed to publish status");
        }
        Ok(report)
    }

    /// Move to `phase` unless the pass has been cancelled
    fn advance(
        &self,
        id: &ObjectIdentity,
        phase: SyncPhase,
        cancel: &CancellationToken,
    ) -> Result<(), PassFailure> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        if !self.registry.set_phase(id, phase)? {
            debug!(phase = phase.as_str(), "Phase transition not applied");
        }
        Ok(())
    }

    async fn run_pass(
        &self,
        descriptor: &SecretDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(PassOutcome, String), PassFailure> {
        let handle = self
            .backends
            .get(&descriptor.backend)
            .ok_or_else(|| SyncError::BackendNotReady(descriptor.backend.clone()))?;

        let fields = fetch::resolve_fields(descriptor, &handle, &self.settings, cancel).await?;

        self.advance(&descriptor.id, SyncPhase::Rendering, cancel)?;
        let payload = render_payload(descriptor, fields)?;

        self.advance(&descriptor.id, SyncPhase::Diffing, cancel)?;
        let outcome = self.diff_and_apply(descriptor, &payload, cancel).await?;

        Ok((outcome, payload.content_hash().to_string()))
    }

    async fn store_call<T>(
        &self,
        stage: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result.map_err(SyncError::Store),
            Err(_elapsed) => Err(SyncError::Timeout {
                stage,
                after: self.settings.store_timeout,
            }),
        }
    }

    async fn diff_and_apply(
        &self,
        descriptor: &SecretDescriptor,
        payload: &RenderedPayload,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, PassFailure> {
        let target = &descriptor.target;
        let mut retried = false;

        loop {
            let existing = match self.store_call("store get", self.store.get(target)).await {
                Ok(handle) => Some(handle),
                Err(SyncError::Store(StoreError::NotFound)) => None,
                Err(e) => return Err(e.into()),
            };

            let written = match apply::plan(descriptor, payload, existing.as_ref())? {
                WritePlan::Unchanged => {
                    debug!(target_secret = %target, "Content hash unchanged, skipping write");
                    return Ok(PassOutcome::Unchanged);
                }
                WritePlan::Create => {
                    self.advance(&descriptor.id, SyncPhase::Applying, cancel)?;
                    self.store_call("store create", self.store.create(target, payload))
                        .await
                        .map(|_| PassOutcome::Created)
                }
                WritePlan::Update(token) => {
                    self.advance(&descriptor.id, SyncPhase::Applying, cancel)?;
                    self.store_call("store update", self.store.update(target, payload, &token))
                        .await
                        .map(|_| PassOutcome::Updated)
                }
                WritePlan::Recreate => {
                    self.advance(&descriptor.id, SyncPhase::Applying, cancel)?;
                    info!(target_secret = %target, secret_type = %payload.secret_type, "Secret type changed, recreating");
                    match self.store_call("store delete", self.store.delete(target)).await {
                        Ok(()) | Err(SyncError::Store(StoreError::NotFound)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.store_call("store create", self.store.create(target, payload))
                        .await
                        .map(|_| PassOutcome::Updated)
                }
            };

            match written {
                Err(SyncError::Store(StoreError::Conflict | StoreError::NotFound)) if !retried => {
                    debug!(target_secret = %target, "Concurrent modification, re-reading target");
                    retried = true;
                }
                Err(SyncError::Store(StoreError::Conflict | StoreError::NotFound)) => {
                    return Err(SyncError::Conflict(target.clone()).into());
                }
                other => return other.map_err(PassFailure::from),
            }
        }
    }
}

/// Build the payload written to the destination object
fn render_payload(
    descriptor: &SecretDescriptor,
    fields: ResolvedFields,
) -> Result<RenderedPayload, SyncError> {
    let mode = match descriptor.creation_policy {
        CreationPolicy::Merge => WriteMode::MergeFields,
        CreationPolicy::Owner | CreationPolicy::None => WriteMode::Replace,
    };

    let (secret_type, data) = match &descriptor.template {
        Some(spec) => {
            let rendered = template::render(&spec.body, &fields)?;
            (
                spec.secret_type.clone(),
                BTreeMap::from([(spec.key.clone(), rendered.to_vec())]),
            )
        }
        None => (
            DEFAULT_SECRET_TYPE.to_string(),
            fields.iter().map(|(k, v)| (k.clone(), v.to_vec())).collect(),
        ),
    };

    Ok(RenderedPayload::new(descriptor.id.clone(), secret_type, mode, data))
}

fn log_failure(descriptor: &SecretDescriptor, e: &SyncError, retry_in: std::time::Duration) {
    let reason = e.reason();
    match e {
        SyncError::Backend(crate::provider::BackendError::AuthError(_)) => error!(
            backend = %descriptor.backend,
            reason,
            error = %e,
            retry_in_secs = retry_in.as_secs(),
            "❌ Fetch failed: backend rejected credentials"
        ),
        SyncError::Backend(_) | SyncError::BackendNotReady(_) => warn!(
            backend = %descriptor.backend,
            reason,
            error = %e,
            retry_in_secs = retry_in.as_secs(),
            "Fetch failed"
        ),
        SyncError::Template(_) => warn!(
            reason,
            error = %e,
            retry_in_secs = retry_in.as_secs(),
            "Render failed"
        ),
        SyncError::OwnershipConflict { target, owner } => error!(
            target_secret = %target,
            owner = %owner,
            reason,
            "❌ Ownership conflict: refusing to overwrite a Secret owned by another descriptor"
        ),
        _ => warn!(
            target_secret = %descriptor.target,
            reason,
            error = %e,
            retry_in_secs = retry_in.as_secs(),
            "Sync failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::descriptor::tests::descriptor;
    use crate::controller::descriptor::TemplateSpec;
    use zeroize::Zeroizing;

    fn fields() -> ResolvedFields {
        ResolvedFields::from([
            ("username".to_string(), Zeroizing::new(b"admin".to_vec())),
            ("password".to_string(), Zeroizing::new(b"s3cr3t".to_vec())),
        ])
    }

    #[test]
    fn test_render_plain_mapping() {
        let payload = render_payload(&descriptor("db"), fields()).unwrap();
        assert_eq!(payload.secret_type, "Opaque");
        assert_eq!(payload.mode, WriteMode::Replace);
        assert_eq!(payload.data().len(), 2);
        assert_eq!(payload.data()["password"], b"s3cr3t".to_vec());
    }

    #[test]
    fn test_render_template_payload() {
        let mut d = descriptor("db");
        d.creation_policy = CreationPolicy::Merge;
        d.template = Some(TemplateSpec {
            body: "{{ .username }}:{{ .password }}".to_string(),
            secret_type: "kubernetes.io/basic-auth".to_string(),
            key: "auth".to_string(),
        });
        let payload = render_payload(&d, fields()).unwrap();
        assert_eq!(payload.mode, WriteMode::MergeFields);
        assert_eq!(payload.secret_type, "kubernetes.io/basic-auth");
        assert_eq!(payload.data()["auth"], b"admin:s3cr3t".to_vec());
    }

    #[test]
    fn test_render_identical_inputs_hash_identically() {
        let a = render_payload(&descriptor("db"), fields()).unwrap();
        let b = render_payload(&descriptor("db"), fields()).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }
}
