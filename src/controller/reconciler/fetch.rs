//! # Fetching
//!
//! Resolves every remote value a pass needs into one [`ResolvedFields`] map.
//!
//! - Explicit mappings are fetched concurrently; with a template only the
//!   mappings its placeholders reference are fetched
//! - `dataFrom` sources are expanded in order, later sources overriding
//!   earlier ones, and explicit mappings overriding both
//! - Every backend call holds a permit from the backend's shared limiter and
//!   runs under the per-call timeout
//! - The first failure aborts the pass; values already resolved are dropped
//!   (and zeroed) with the partial map

use crate::controller::descriptor::{DataFromSource, FieldMapping, SecretDescriptor};
use crate::controller::payload::ResolvedFields;
use crate::controller::reconciler::types::{ReconcileSettings, SyncError};
use crate::controller::template;
use crate::provider::pool::BackendHandle;
use crate::provider::BackendError;
use futures::future::try_join_all;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};
use zeroize::Zeroizing;

/// Run one backend call under the limiter, the call timeout and the cancel token
async fn call<T, F>(
    handle: &BackendHandle,
    settings: &ReconcileSettings,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    let _permit = tokio::select! {
        permit = handle.limiter.acquire() => permit
            .map_err(|_closed| SyncError::BackendNotReady(handle.backend_ref.id.clone()))?,
        () = cancel.cancelled() => return Err(SyncError::Cancelled),
    };

    tokio::select! {
        result = tokio::time::timeout(settings.fetch_timeout, operation) => match result {
            Ok(value) => value.map_err(SyncError::from),
            Err(_elapsed) => Err(SyncError::Backend(BackendError::Unreachable(format!(
                "backend call timed out after {:?}",
                settings.fetch_timeout
            )))),
        },
        () = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}

/// Mappings this pass has to fetch
fn mappings_to_fetch(descriptor: &SecretDescriptor) -> Result<Vec<&FieldMapping>, SyncError> {
    let Some(template) = &descriptor.template else {
        return Ok(descriptor.mappings.iter().collect());
    };
    let referenced = template::referenced_fields(&template.body)?;
    Ok(descriptor
        .mappings
        .iter()
        .filter(|m| referenced.contains(&m.secret_key))
        .collect())
}

async fn fetch_mapping(
    handle: &BackendHandle,
    settings: &ReconcileSettings,
    cancel: &CancellationToken,
    mapping: &FieldMapping,
) -> Result<(String, Zeroizing<Vec<u8>>), SyncError> {
    let remote = &mapping.remote_ref;
    let value = call(
        handle,
        settings,
        cancel,
        handle.client.fetch(&remote.key, remote.property.as_deref()),
    )
    .instrument(debug_span!("fetch", remote_key = %remote.key))
    .await?;

    if let Some(revision) = &value.revision {
        debug!(remote_key = %remote.key, revision = %revision, "Resolved remote revision");
    }
    Ok((mapping.secret_key.clone(), value.into_bytes()))
}

/// Spread the top-level properties of one remote JSON object
async fn extract(
    handle: &BackendHandle,
    settings: &ReconcileSettings,
    cancel: &CancellationToken,
    key: &str,
    fields: &mut ResolvedFields,
) -> Result<(), SyncError> {
    let value = call(handle, settings, cancel, handle.client.fetch(key, None))
        .instrument(debug_span!("extract", remote_key = %key))
        .await?;
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(value.bytes())
        .map_err(|_not_object| BackendError::not_found(format!("{key} (not a JSON object)")))?;

    for (property, property_value) in object {
        let bytes = match property_value {
            serde_json::Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        fields.insert(property, Zeroizing::new(bytes));
    }
    Ok(())
}

/// List keys under `prefix` and store each under its last path segment
async fn find(
    handle: &BackendHandle,
    settings: &ReconcileSettings,
    cancel: &CancellationToken,
    prefix: &str,
    fields: &mut ResolvedFields,
) -> Result<(), SyncError> {
    let keys = call(handle, settings, cancel, handle.client.list(prefix))
        .instrument(debug_span!("find", prefix = %prefix))
        .await?;
    debug!(prefix = %prefix, count = keys.len(), "Listed remote keys");

    let fetches = keys.iter().map(|key| async move {
        let value = call(handle, settings, cancel, handle.client.fetch(key, None)).await?;
        let local = key.rsplit('/').next().unwrap_or(key).to_string();
        Ok::<_, SyncError>((local, value.into_bytes()))
    });
    fields.extend(try_join_all(fetches).await?);
    Ok(())
}

/// Resolve every value the descriptor needs
///
/// # Errors
/// The first fetch, list or template parse failure, or `SyncError::Cancelled`.
pub(super) async fn resolve_fields(
    descriptor: &SecretDescriptor,
    handle: &BackendHandle,
    settings: &ReconcileSettings,
    cancel: &CancellationToken,
) -> Result<ResolvedFields, SyncError> {
    let mappings = mappings_to_fetch(descriptor)?;
    let mut fields = ResolvedFields::new();

    for source in &descriptor.data_from {
        match source {
            DataFromSource::Extract { key } => {
                extract(handle, settings, cancel, key, &mut fields).await?;
            }
            DataFromSource::Find { prefix } => {
                find(handle, settings, cancel, prefix, &mut fields).await?;
            }
        }
    }

    let fetched = try_join_all(
        mappings
            .into_iter()
            .map(|mapping| fetch_mapping(handle, settings, cancel, mapping)),
    )
    .await?;
    fields.extend(fetched);

    Ok(fields)
}
