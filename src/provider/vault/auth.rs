//! Vault token acquisition.
//!
//! Static tokens are read from the environment on every call so a rotated
//! token is picked up without a restart. Kubernetes logins are cached until
//! the backend reports an authentication failure.

use crate::provider::{BackendError, VaultAuth};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[derive(Debug, Serialize)]
struct KubernetesLoginRequest<'a> {
    role: &'a str,
    jwt: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

impl std::fmt::Debug for LoginAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginAuth").finish_non_exhaustive()
    }
}

pub(crate) struct TokenSource {
    auth: VaultAuth,
    cached: Mutex<Option<Zeroizing<String>>>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    pub(crate) fn new(auth: VaultAuth) -> Self {
        Self {
            auth,
            cached: Mutex::new(None),
        }
    }

    /// Current client token, logging in first if needed
    pub(crate) async fn token(
        &self,
        http: &Client,
        server: &str,
        namespace: Option<&str>,
    ) -> Result<Zeroizing<String>, BackendError> {
        match &self.auth {
            VaultAuth::Token { env_var } => std::env::var(env_var)
                .map(Zeroizing::new)
                .map_err(|_unset| {
                    BackendError::AuthError(format!("token environment variable {env_var} is not set"))
                }),
            VaultAuth::Kubernetes {
                mount_path,
                role,
                token_path,
            } => {
                let mut cached = self.cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    return Ok(token.clone());
                }
                let token =
                    kubernetes_login(http, server, namespace, mount_path, role, token_path).await?;
                *cached = Some(token.clone());
                Ok(token)
            }
        }
    }

    /// Forget a cached login after the backend rejected it
    pub(crate) async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.take().is_some() {
            debug!("Dropped cached Vault login token");
        }
    }
}

async fn kubernetes_login(
    http: &Client,
    server: &str,
    namespace: Option<&str>,
    mount_path: &str,
    role: &str,
    token_path: &str,
) -> Result<Zeroizing<String>, BackendError> {
    let jwt = Zeroizing::new(tokio::fs::read_to_string(token_path).await.map_err(|e| {
        BackendError::AuthError(format!(
            "failed to read service account token from {token_path}: {e}"
        ))
    })?);

    let url = format!(
        "{}/v1/auth/{}/login",
        server.trim_end_matches('/'),
        mount_path.trim_matches('/')
    );
    let mut request = http.post(&url).json(&KubernetesLoginRequest {
        role,
        jwt: jwt.trim(),
    });
    if let Some(namespace) = namespace {
        request = request.header("X-Vault-Namespace", namespace);
    }

    let response = request
        .send()
        .await
        .map_err(|e| BackendError::Unreachable(format!("Vault login request failed: {e}")))?;
    let status = response.status();
    if status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(BackendError::AuthError(format!(
            "Vault kubernetes login for role '{role}' rejected with status {status}"
        )));
    }
    if !status.is_success() {
        return Err(BackendError::Unreachable(format!(
            "Vault kubernetes login returned status {status}"
        )));
    }

    let login: LoginResponse = response.json().await.map_err(|e| {
        BackendError::Unreachable(format!("failed to parse Vault login response: {e}"))
    })?;
    info!(role = %role, mount = %mount_path, "Logged in to Vault with Kubernetes auth");
    Ok(Zeroizing::new(login.auth.client_token))
}
