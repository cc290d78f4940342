//! Kubernetes `Secret` store adapter.
//!
//! - Concurrency token: `metadata.resourceVersion`
//! - Owner marker: annotation `secretsync.octopilot.io/owner` (`namespace/name`)
//! - Content hashes: annotation `secretsync.octopilot.io/content-hashes`, a JSON
//!   map from descriptor identity to the hash it last wrote
//! - Label `app.kubernetes.io/managed-by` set to the field manager
//!
//! Updates use `replace` with the caller's resourceVersion, so a concurrent
//! writer causes a 409 which surfaces as [`StoreError::Conflict`].

use crate::constants::{
    CONTENT_HASHES_ANNOTATION, DEFAULT_SECRET_TYPE, MANAGED_BY_LABEL, OWNER_ANNOTATION,
};
use crate::controller::descriptor::ObjectIdentity;
use crate::controller::payload::{RenderedPayload, WriteMode};
use crate::observability::metrics;
use crate::store::{
    next_content_hashes, ConcurrencyToken, StoreAdapter, StoreError, StoreObjectHandle,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone)]
pub struct KubernetesSecretStore {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for KubernetesSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesSecretStore")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubernetesSecretStore {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        }
    }
}

fn map_kube_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound,
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict,
        kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 => {
            StoreError::Unavailable(api_err.message)
        }
        kube::Error::Api(api_err) => StoreError::Api(format!("{} ({})", api_err.message, api_err.code)),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Destination-side view of a `Secret`
pub(crate) fn handle_from_secret(identity: &ObjectIdentity, secret: &Secret) -> StoreObjectHandle {
    let annotations = secret.metadata.annotations.as_ref();
    let owner = annotations
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .and_then(|value| ObjectIdentity::parse(value));
    let content_hashes = annotations
        .and_then(|a| a.get(CONTENT_HASHES_ANNOTATION))
        .and_then(|value| serde_json::from_str::<BTreeMap<String, String>>(value).ok())
        .unwrap_or_default();
    let keys = secret
        .data
        .as_ref()
        .map(|data| data.keys().cloned().collect())
        .unwrap_or_default();

    StoreObjectHandle {
        identity: identity.clone(),
        token: ConcurrencyToken(secret.metadata.resource_version.clone().unwrap_or_default()),
        secret_type: secret
            .type_
            .clone()
            .unwrap_or_else(|| DEFAULT_SECRET_TYPE.to_string()),
        owner,
        content_hashes,
        keys,
    }
}

/// Build the `Secret` to write, starting from `existing` when updating
///
/// The type is only set on creation; the API server rejects type changes.
pub(crate) fn build_secret(
    identity: &ObjectIdentity,
    existing: Option<Secret>,
    payload: &RenderedPayload,
    field_manager: &str,
) -> Result<Secret, StoreError> {
    let mut secret = existing.unwrap_or_else(|| Secret {
        metadata: ObjectMeta {
            name: Some(identity.name.clone()),
            namespace: Some(identity.namespace.clone()),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    });

    let previous_hashes = handle_from_secret(identity, &secret).content_hashes;
    let creating = secret.metadata.resource_version.is_none();
    let payload_data = payload
        .data()
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())));

    match payload.mode {
        WriteMode::Replace => {
            secret.data = Some(payload_data.collect());
            secret.string_data = None;
        }
        WriteMode::MergeFields => {
            secret.data.get_or_insert_with(BTreeMap::new).extend(payload_data);
        }
    }
    if creating {
        secret.type_ = Some(payload.secret_type.clone());
    }

    let hashes = serde_json::to_string(&next_content_hashes(&previous_hashes, payload))
        .map_err(|e| StoreError::Api(format!("failed to encode content hashes: {e}")))?;
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(CONTENT_HASHES_ANNOTATION.to_string(), hashes);
    if payload.mode == WriteMode::Replace || creating {
        annotations.insert(OWNER_ANNOTATION.to_string(), payload.owner.to_string());
        secret
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(MANAGED_BY_LABEL.to_string(), field_manager.to_string());
    }

    Ok(secret)
}

#[async_trait]
impl StoreAdapter for KubernetesSecretStore {
    async fn get(&self, identity: &ObjectIdentity) -> Result<StoreObjectHandle, StoreError> {
        let secret = self
            .api(&identity.namespace)
            .get_opt(&identity.name)
            .await
            .map_err(map_kube_error)?
            .ok_or(StoreError::NotFound)?;
        Ok(handle_from_secret(identity, &secret))
    }

    async fn create(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
    ) -> Result<StoreObjectHandle, StoreError> {
        let secret = build_secret(identity, None, payload, &self.field_manager)?;
        let created = self
            .api(&identity.namespace)
            .create(&self.post_params(), &secret)
            .await
            .map_err(map_kube_error)?;
        metrics::increment_store_writes("create");
        debug!(secret = %identity, "Created Secret");
        Ok(handle_from_secret(identity, &created))
    }

    async fn update(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
        token: &ConcurrencyToken,
    ) -> Result<StoreObjectHandle, StoreError> {
        let api = self.api(&identity.namespace);
        let current = api.get(&identity.name).await.map_err(map_kube_error)?;
        if current.metadata.resource_version.as_deref() != Some(token.0.as_str()) {
            return Err(StoreError::Conflict);
        }
        let current_type = current.type_.as_deref().unwrap_or(DEFAULT_SECRET_TYPE);
        if payload.mode == WriteMode::Replace && current_type != payload.secret_type {
            return Err(StoreError::TypeChange {
                existing: current_type.to_string(),
                requested: payload.secret_type.clone(),
            });
        }

        let secret = build_secret(identity, Some(current), payload, &self.field_manager)?;
        let replaced = api
            .replace(&identity.name, &self.post_params(), &secret)
            .await
            .map_err(map_kube_error)?;
        metrics::increment_store_writes("update");
        debug!(secret = %identity, "Updated Secret");
        Ok(handle_from_secret(identity, &replaced))
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), StoreError> {
        self.api(&identity.namespace)
            .delete(&identity.name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        metrics::increment_store_writes("delete");
        Ok(())
    }
}
