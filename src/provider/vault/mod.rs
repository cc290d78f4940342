//! # Vault KV Client
//!
//! REST client for the HashiCorp Vault KV secrets engine (v1 and v2).
//!
//! Uses reqwest directly rather than an SDK, which keeps the client usable
//! against Pact mock servers.
//!
//! | Operation | KV v2 | KV v1 |
//! |-----------|-------|-------|
//! | fetch | `GET /v1/{mount}/data/{key}` | `GET /v1/{mount}/{key}` |
//! | list | `GET /v1/{mount}/metadata/{prefix}?list=true` | `GET /v1/{mount}/{prefix}?list=true` |
//! | health | `GET /v1/sys/health` | same |
//!
//! Status mapping: 404 is `NotFound`, 401/403 is `AuthError`, anything else
//! non-successful (and transport errors) is `Unreachable`.

mod auth;

use crate::controller::payload::ResolvedSecretValue;
use crate::observability::metrics;
use crate::provider::{
    select_from_object, BackendError, BackendKind, HealthStatus, SecretBackend, VaultConnection,
    VaultKvVersion,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use auth::TokenSource;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

/// `data` envelope of a KV v2 read
#[derive(Debug, Deserialize)]
struct KvV2Data {
    data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    metadata: Option<KvV2Metadata>,
}

#[derive(Debug, Deserialize)]
struct KvV2Metadata {
    #[serde(default)]
    version: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

/// Vault KV backend
pub struct VaultKvBackend {
    http: Client,
    server: String,
    connection: VaultConnection,
    tokens: TokenSource,
}

impl std::fmt::Debug for VaultKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKvBackend")
            .field("server", &self.server)
            .field("mount", &self.connection.mount)
            .field("kv_version", &self.connection.kv_version)
            .finish_non_exhaustive()
    }
}

impl VaultKvBackend {
    /// Create a client for one Vault connection
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(connection: VaultConnection) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        let server = connection.server.trim_end_matches('/').to_string();
        let tokens = TokenSource::new(connection.auth.clone());
        Ok(Self {
            http,
            server,
            connection,
            tokens,
        })
    }

    fn mount(&self) -> &str {
        self.connection.mount.trim_matches('/')
    }

    fn read_url(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        match self.connection.kv_version {
            VaultKvVersion::V2 => format!("{}/v1/{}/data/{key}", self.server, self.mount()),
            VaultKvVersion::V1 => format!("{}/v1/{}/{key}", self.server, self.mount()),
        }
    }

    fn list_url(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let base = match self.connection.kv_version {
            VaultKvVersion::V2 => format!("{}/v1/{}/metadata", self.server, self.mount()),
            VaultKvVersion::V1 => format!("{}/v1/{}", self.server, self.mount()),
        };
        if prefix.is_empty() {
            base
        } else {
            format!("{base}/{prefix}")
        }
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, BackendError> {
        let token = self
            .tokens
            .token(&self.http, &self.server, self.connection.namespace.as_deref())
            .await?;

        let mut request = self
            .http
            .get(url)
            .query(query)
            .header("X-Vault-Token", token.as_str());
        if let Some(namespace) = &self.connection.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        request
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(format!("request to {url} failed: {e}")))
    }

    /// Map a non-success status to the backend error taxonomy
    async fn status_error(&self, status: StatusCode, key: &str) -> BackendError {
        match status.as_u16() {
            404 => BackendError::not_found(key),
            401 | 403 => {
                self.tokens.invalidate().await;
                BackendError::AuthError(format!("Vault denied access to '{key}' ({status})"))
            }
            _ => BackendError::Unreachable(format!("Vault returned {status} for '{key}'")),
        }
    }

    async fn read_object(
        &self,
        key: &str,
    ) -> Result<(serde_json::Map<String, serde_json::Value>, Option<String>), BackendError> {
        let response = self.get(&self.read_url(key), &[]).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, key).await);
        }

        let parse_error = |e: reqwest::Error| {
            BackendError::Unreachable(format!("malformed Vault response for '{key}': {e}"))
        };
        match self.connection.kv_version {
            VaultKvVersion::V2 => {
                let body: ReadResponse<KvV2Data> = response.json().await.map_err(parse_error)?;
                let revision = body
                    .data
                    .metadata
                    .and_then(|m| m.version)
                    .map(|v| v.to_string());
                Ok((body.data.data, revision))
            }
            VaultKvVersion::V1 => {
                let body: ReadResponse<serde_json::Map<String, serde_json::Value>> =
                    response.json().await.map_err(parse_error)?;
                Ok((body.data, None))
            }
        }
    }

    fn record(&self, operation: &str, start: Instant, result: Result<(), &BackendError>) {
        metrics::record_backend_operation(
            BackendKind::VaultLike,
            operation,
            start.elapsed().as_secs_f64(),
        );
        if let Err(e) = result {
            metrics::increment_backend_operation_errors(BackendKind::VaultLike, e.reason());
        }
    }
}

#[async_trait]
impl SecretBackend for VaultKvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VaultLike
    }

    async fn fetch(
        &self,
        remote_key: &str,
        property: Option<&str>,
    ) -> Result<ResolvedSecretValue, BackendError> {
        let span = debug_span!("vault.kv.read", secret.key = remote_key, mount = self.mount());
        let start = Instant::now();

        let result: Result<ResolvedSecretValue, BackendError> = async {
            let (object, revision) = self.read_object(remote_key).await?;
            let value = match property {
                Some(property) => select_from_object(&object, property)
                    .ok_or_else(|| BackendError::not_found(format!("{remote_key}#{property}")))?,
                None => serde_json::to_vec(&object).map_err(|e| {
                    BackendError::Unreachable(format!("failed to encode '{remote_key}': {e}"))
                })?,
            };
            Ok(ResolvedSecretValue::new(
                remote_key,
                property.map(ToString::to_string),
                value,
                revision,
            ))
        }
        .instrument(span)
        .await;

        self.record("get", start, result.as_ref().map(|_| ()));
        result
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let start = Instant::now();
        let result: Result<Vec<String>, BackendError> = async {
            let response = self.get(&self.list_url(prefix), &[("list", "true")]).await?;
            let status = response.status();
            // Vault answers 404 for an empty folder
            if status == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                return Err(self.status_error(status, prefix).await);
            }
            let body: ReadResponse<ListData> = response.json().await.map_err(|e| {
                BackendError::Unreachable(format!("malformed Vault list response: {e}"))
            })?;

            let base = prefix.trim_matches('/');
            Ok(body
                .data
                .keys
                .into_iter()
                .filter(|k| !k.ends_with('/'))
                .map(|k| if base.is_empty() { k } else { format!("{base}/{k}") })
                .collect())
        }
        .instrument(debug_span!("vault.kv.list", prefix = prefix))
        .await;

        self.record("list", start, result.as_ref().map(|_| ()));
        result
    }

    async fn health_check(&self) -> HealthStatus {
        let url = format!("{}/v1/sys/health", self.server);
        match self.http.get(&url).send().await {
            // 429 standby, 472 DR secondary, 473 performance standby
            Ok(response) if matches!(response.status().as_u16(), 200 | 429 | 472 | 473) => {
                HealthStatus::Healthy
            }
            Ok(response) => {
                debug!(status = %response.status(), "Vault health check failed");
                HealthStatus::Unreachable
            }
            Err(e) => {
                warn!(server = %self.server, error = %e, "Vault health check request failed");
                HealthStatus::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::VaultAuth;

    fn backend(version: VaultKvVersion) -> VaultKvBackend {
        VaultKvBackend::new(VaultConnection {
            server: "https://vault.example:8200/".to_string(),
            mount: "/secret/".to_string(),
            kv_version: version,
            namespace: None,
            auth: VaultAuth::Token {
                env_var: "VAULT_TOKEN".to_string(),
            },
        })
        .unwrap()
    }

    #[test]
    fn test_v2_urls() {
        let backend = backend(VaultKvVersion::V2);
        assert_eq!(
            backend.read_url("database/postgres"),
            "https://vault.example:8200/v1/secret/data/database/postgres"
        );
        assert_eq!(
            backend.list_url("apps/team-a/"),
            "https://vault.example:8200/v1/secret/metadata/apps/team-a"
        );
        assert_eq!(
            backend.list_url(""),
            "https://vault.example:8200/v1/secret/metadata"
        );
    }

    #[test]
    fn test_v1_urls() {
        let backend = backend(VaultKvVersion::V1);
        assert_eq!(
            backend.read_url("database/postgres"),
            "https://vault.example:8200/v1/secret/database/postgres"
        );
        assert_eq!(
            backend.list_url("apps"),
            "https://vault.example:8200/v1/secret/apps"
        );
    }
}
