//! # Provider Modules
//!
//! Backend clients for external secret sources.
//!
//! Each backend kind implements [`SecretBackend`]. A client is built once per
//! `SecretStore` load by [`connect`] and held as an opaque `Arc<dyn SecretBackend>`
//! inside the [`pool::BackendPool`]; callers never dispatch on the kind again.

use crate::controller::payload::ResolvedSecretValue;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod aws;
pub mod pool;
pub mod vault;

/// Where a backend definition lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendScope {
    /// Namespaced `SecretStore`
    Namespaced(String),
    /// `ClusterSecretStore`
    Cluster,
}

/// Identity of a backend definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId {
    pub scope: BackendScope,
    pub name: String,
}

impl BackendId {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: BackendScope::Namespaced(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            scope: BackendScope::Cluster,
            name: name.into(),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            BackendScope::Namespaced(namespace) => write!(f, "SecretStore/{namespace}/{}", self.name),
            BackendScope::Cluster => write!(f, "ClusterSecretStore/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    VaultLike,
    CloudSecretsManager,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::VaultLike => "vault",
            BackendKind::CloudSecretsManager => "aws",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unreachable,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "Unknown",
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Unreachable => "Unreachable",
        }
    }

    /// Value exported on the health gauge
    #[must_use]
    pub fn gauge_value(&self) -> i64 {
        match self {
            HealthStatus::Unknown => -1,
            HealthStatus::Healthy => 1,
            HealthStatus::Unreachable => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultKvVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultAuth {
    /// Static token read from an environment variable
    Token { env_var: String },
    /// Kubernetes service account login
    Kubernetes {
        mount_path: String,
        role: String,
        token_path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConnection {
    pub server: String,
    /// KV mount, used as the path prefix for every key
    pub mount: String,
    pub kv_version: VaultKvVersion,
    /// Enterprise namespace sent as `X-Vault-Namespace`
    pub namespace: Option<String>,
    pub auth: VaultAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwsAuth {
    /// Default credential chain (IRSA, instance profile, env)
    Ambient,
    AccessKeys {
        access_key_id_env: String,
        secret_access_key_env: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsConnection {
    pub region: String,
    pub endpoint: Option<String>,
    /// Prepended to every remote key
    pub prefix: Option<String>,
    pub auth: AwsAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConnection {
    Vault(VaultConnection),
    Aws(AwsConnection),
}

/// Identity, connection parameters and health of one external secret source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRef {
    pub id: BackendId,
    pub connection: BackendConnection,
    /// Per-backend fetch limit; `None` uses the controller default
    pub max_concurrency: Option<usize>,
    pub health: HealthStatus,
}

impl BackendRef {
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self.connection {
            BackendConnection::Vault(_) => BackendKind::VaultLike,
            BackendConnection::Aws(_) => BackendKind::CloudSecretsManager,
        }
    }
}

/// Backend call failures, split so the engine can report them distinctly
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("remote secret '{key}' not found")]
    NotFound { key: String },
    #[error("backend authentication failed: {0}")]
    AuthError(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
}

impl BackendError {
    pub fn not_found(key: impl Into<String>) -> Self {
        BackendError::NotFound { key: key.into() }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            BackendError::NotFound { .. } => "NotFound",
            BackendError::AuthError(_) => "AuthError",
            BackendError::Unreachable(_) => "Unreachable",
        }
    }
}

/// Capability interface over one external secret source
///
/// Implementations must not cache values: every `fetch` reflects the current
/// remote state.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Fetch one remote value, optionally selecting a property of a JSON object
    async fn fetch(
        &self,
        remote_key: &str,
        property: Option<&str>,
    ) -> Result<ResolvedSecretValue, BackendError>;

    /// List remote keys under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    async fn health_check(&self) -> HealthStatus;
}

/// Build the client for a backend definition
///
/// # Errors
/// Returns an error if the client cannot be constructed (bad URL, TLS setup).
pub async fn connect(backend: &BackendRef) -> anyhow::Result<Arc<dyn SecretBackend>> {
    match &backend.connection {
        BackendConnection::Vault(connection) => {
            Ok(Arc::new(vault::VaultKvBackend::new(connection.clone())?))
        }
        BackendConnection::Aws(connection) => {
            Ok(Arc::new(aws::AwsSecretsManagerBackend::new(connection).await?))
        }
    }
}

/// Pick `property` out of a raw payload
///
/// With a property the payload must be a JSON object: string values are
/// returned verbatim, other values serialised. Without one the payload is
/// returned unchanged.
///
/// # Errors
/// `BackendError::NotFound` if the payload is not an object or lacks the property.
pub fn select_property(
    remote_key: &str,
    payload: &[u8],
    property: Option<&str>,
) -> Result<Vec<u8>, BackendError> {
    let Some(property) = property else {
        return Ok(payload.to_vec());
    };

    let missing = || BackendError::not_found(format!("{remote_key}#{property}"));
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(payload).map_err(|_not_json| missing())?;
    select_from_object(&object, property).ok_or_else(missing)
}

/// Property lookup on an already-parsed JSON object
pub(crate) fn select_from_object(
    object: &serde_json::Map<String, serde_json::Value>,
    property: &str,
) -> Option<Vec<u8>> {
    match object.get(property)? {
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        other => Some(other.to_string().into_bytes()),
    }
}
