//! # SecretStore / ClusterSecretStore
//!
//! Backend definitions. A `SecretStore` is visible to `ExternalSecret`s in its
//! own namespace; a `ClusterSecretStore` to every namespace.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: secretsync.octopilot.io/v1beta1
//! kind: SecretStore
//! metadata:
//!   name: vault-backend
//!   namespace: team-a
//! spec:
//!   provider:
//!     type: vault
//!     server: https://vault.example:8200
//!     path: secret
//!     version: v2
//!     auth:
//!       type: kubernetes
//!       role: team-a
//!   maxConcurrentFetches: 4
//! ```

use crate::provider::{
    AwsAuth, AwsConnection, BackendConnection, BackendId, BackendRef, HealthStatus, VaultAuth,
    VaultConnection, VaultKvVersion,
};
use anyhow::{Context, Result};
use kube::ResourceExt;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "SecretStore",
    group = "secretsync.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::SecretStoreStatus",
    shortname = "ss",
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider.type"}, {"name":"Health", "type":"string", "jsonPath":".status.health"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreSpec {
    pub provider: ProviderSpec,
    /// Maximum concurrent fetches against this backend
    #[serde(default)]
    pub max_concurrent_fetches: Option<u32>,
}

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterSecretStore",
    group = "secretsync.octopilot.io",
    version = "v1beta1",
    status = "crate::crd::SecretStoreStatus",
    shortname = "css",
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider.type"}, {"name":"Health", "type":"string", "jsonPath":".status.health"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretStoreSpec {
    pub provider: ProviderSpec,
    #[serde(default)]
    pub max_concurrent_fetches: Option<u32>,
}

/// Backend kind and connection parameters, tagged by `type`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderSpec {
    Vault(VaultProvider),
    Aws(AwsProvider),
}

/// The variants share the `type` discriminator (and `auth.type`) with
/// different enum values, which a structural schema cannot express as
/// `oneOf`. Publish one flat object instead and leave per-kind validation to
/// `to_connection`.
impl JsonSchema for ProviderSpec {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("ProviderSpec")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        schemars::json_schema!({
            "type": "object",
            "description": "Backend connection: a Vault-like KV engine or AWS Secrets Manager",
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["vault", "aws"],
                    "description": "Backend kind"
                },
                "server": {
                    "type": "string",
                    "description": "Vault address, e.g. https://vault.example:8200"
                },
                "path": {
                    "type": "string",
                    "description": "Vault KV mount path (default: secret)"
                },
                "version": {
                    "type": "string",
                    "enum": ["v1", "v2"],
                    "description": "Vault KV engine version (default: v2)"
                },
                "namespace": {
                    "type": "string",
                    "description": "Vault enterprise namespace"
                },
                "region": {
                    "type": "string",
                    "description": "AWS region"
                },
                "endpoint": {
                    "type": "string",
                    "description": "AWS endpoint override"
                },
                "prefix": {
                    "type": "string",
                    "description": "Prepended to every AWS secret name"
                },
                "auth": {
                    "type": "object",
                    "description": "Vault: token or kubernetes. AWS: accessKeys, or omit for the default credential chain",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["token", "kubernetes", "accessKeys"]
                        },
                        "envVar": { "type": "string" },
                        "mountPath": { "type": "string" },
                        "role": { "type": "string" },
                        "serviceAccountTokenPath": { "type": "string" },
                        "accessKeyIdEnv": { "type": "string" },
                        "secretAccessKeyEnv": { "type": "string" }
                    },
                    "required": ["type"]
                }
            },
            "required": ["type"]
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultProvider {
    /// Vault address, e.g. `https://vault.example:8200`
    pub server: String,
    /// KV mount path
    #[serde(default = "default_vault_path")]
    pub path: String,
    #[serde(default)]
    pub version: VaultKvVersionSpec,
    /// Enterprise namespace
    #[serde(default)]
    pub namespace: Option<String>,
    pub auth: VaultAuthSpec,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VaultKvVersionSpec {
    V1,
    #[default]
    V2,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VaultAuthSpec {
    Token(VaultTokenAuth),
    Kubernetes(VaultKubernetesAuth),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultTokenAuth {
    /// Environment variable of the controller holding the token
    #[serde(default = "default_token_env")]
    pub env_var: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultKubernetesAuth {
    #[serde(default = "default_kubernetes_mount")]
    pub mount_path: String,
    pub role: String,
    #[serde(default = "default_service_account_token_path")]
    pub service_account_token_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsProvider {
    pub region: String,
    /// Endpoint override (LocalStack, VPC endpoints)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Prepended to every remote key
    #[serde(default)]
    pub prefix: Option<String>,
    /// Absent means the default credential chain (IRSA)
    #[serde(default)]
    pub auth: Option<AwsAuthSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AwsAuthSpec {
    AccessKeys(AwsAccessKeysAuth),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsAccessKeysAuth {
    #[serde(default = "default_access_key_id_env")]
    pub access_key_id_env: String,
    #[serde(default = "default_secret_access_key_env")]
    pub secret_access_key_env: String,
}

fn default_vault_path() -> String {
    "secret".to_string()
}

fn default_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_kubernetes_mount() -> String {
    "kubernetes".to_string()
}

fn default_service_account_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_access_key_id_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}

fn default_secret_access_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

impl ProviderSpec {
    /// Validate and convert into connection parameters
    ///
    /// # Errors
    /// Returns an error for an empty or non-HTTP Vault server, or an empty AWS region.
    pub fn to_connection(&self) -> Result<BackendConnection> {
        match self {
            ProviderSpec::Vault(vault) => {
                let server = vault.server.trim();
                if !(server.starts_with("http://") || server.starts_with("https://")) {
                    anyhow::bail!("vault server '{server}' must be an http(s) URL");
                }
                if vault.path.trim_matches('/').is_empty() {
                    anyhow::bail!("vault path must not be empty");
                }
                let auth = match &vault.auth {
                    VaultAuthSpec::Token(token) => VaultAuth::Token {
                        env_var: token.env_var.clone(),
                    },
                    VaultAuthSpec::Kubernetes(k8s) => {
                        if k8s.role.is_empty() {
                            anyhow::bail!("vault kubernetes auth requires a role");
                        }
                        VaultAuth::Kubernetes {
                            mount_path: k8s.mount_path.clone(),
                            role: k8s.role.clone(),
                            token_path: k8s.service_account_token_path.clone(),
                        }
                    }
                };
                Ok(BackendConnection::Vault(VaultConnection {
                    server: server.to_string(),
                    mount: vault.path.clone(),
                    kv_version: match vault.version {
                        VaultKvVersionSpec::V1 => VaultKvVersion::V1,
                        VaultKvVersionSpec::V2 => VaultKvVersion::V2,
                    },
                    namespace: vault.namespace.clone(),
                    auth,
                }))
            }
            ProviderSpec::Aws(aws) => {
                if aws.region.trim().is_empty() {
                    anyhow::bail!("aws region must not be empty");
                }
                let auth = match &aws.auth {
                    None => AwsAuth::Ambient,
                    Some(AwsAuthSpec::AccessKeys(keys)) => AwsAuth::AccessKeys {
                        access_key_id_env: keys.access_key_id_env.clone(),
                        secret_access_key_env: keys.secret_access_key_env.clone(),
                    },
                };
                Ok(BackendConnection::Aws(AwsConnection {
                    region: aws.region.trim().to_string(),
                    endpoint: aws.endpoint.clone(),
                    prefix: aws.prefix.clone(),
                    auth,
                }))
            }
        }
    }
}

fn backend_ref(id: BackendId, provider: &ProviderSpec, max: Option<u32>) -> Result<BackendRef> {
    let connection = provider
        .to_connection()
        .with_context(|| format!("invalid provider in {id}"))?;
    Ok(BackendRef {
        id,
        connection,
        max_concurrency: max.and_then(|m| usize::try_from(m).ok()).filter(|m| *m > 0),
        health: HealthStatus::Unknown,
    })
}

impl SecretStore {
    #[must_use]
    pub fn backend_id(&self) -> BackendId {
        BackendId::namespaced(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// # Errors
    /// Returns an error if the store has no namespace or an invalid provider.
    pub fn to_backend_ref(&self) -> Result<BackendRef> {
        if self.namespace().is_none() {
            anyhow::bail!("SecretStore {} has no namespace", self.name_any());
        }
        backend_ref(self.backend_id(), &self.spec.provider, self.spec.max_concurrent_fetches)
    }
}

impl ClusterSecretStore {
    #[must_use]
    pub fn backend_id(&self) -> BackendId {
        BackendId::cluster(self.name_any())
    }

    /// # Errors
    /// Returns an error if the provider is invalid.
    pub fn to_backend_ref(&self) -> Result<BackendRef> {
        backend_ref(self.backend_id(), &self.spec.provider, self.spec.max_concurrent_fetches)
    }
}
