//! # AWS Secrets Manager Client
//!
//! Reads secrets from AWS Secrets Manager.
//!
//! Supports IRSA (IAM Roles for Service Accounts) through the default
//! credential chain and static access keys read from environment variables.
//! A configured key prefix is prepended to every remote key and stripped
//! again from listed names.

use crate::controller::payload::ResolvedSecretValue;
use crate::observability::metrics;
use crate::provider::{
    select_property, AwsAuth, AwsConnection, BackendError, BackendKind, HealthStatus,
    SecretBackend,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_secretsmanager::config::http::HttpResponse;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::types::{Filter, FilterNameStringType};
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use std::time::Instant;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Error codes that mean the credentials, not the service, are the problem
const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDeniedException",
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
];

/// AWS Secrets Manager backend
pub struct AwsSecretsManagerBackend {
    client: SecretsManagerClient,
    region: String,
    prefix: String,
}

impl std::fmt::Debug for AwsSecretsManagerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManagerBackend")
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AwsSecretsManagerBackend {
    /// Create a new AWS Secrets Manager client
    ///
    /// # Errors
    /// Returns an error if static access keys are configured but their
    /// environment variables are missing.
    pub async fn new(connection: &AwsConnection) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(connection.region.clone()));

        match &connection.auth {
            AwsAuth::Ambient => {
                info!("No auth configuration specified, using the default AWS credential chain (IRSA)");
            }
            AwsAuth::AccessKeys {
                access_key_id_env,
                secret_access_key_env,
            } => {
                let access_key_id = std::env::var(access_key_id_env)
                    .with_context(|| format!("{access_key_id_env} is not set"))?;
                let secret_access_key = std::env::var(secret_access_key_env)
                    .with_context(|| format!("{secret_access_key_env} is not set"))?;
                info!("Using static AWS access keys from {access_key_id_env}");
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "secret-sync-controller",
                ));
            }
        }

        if let Some(endpoint) = &connection.endpoint {
            info!("Using AWS Secrets Manager endpoint override: {endpoint}");
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        Ok(Self {
            client: SecretsManagerClient::new(&sdk_config),
            region: connection.region.clone(),
            prefix: connection.prefix.clone().unwrap_or_default(),
        })
    }

    fn qualified(&self, remote_key: &str) -> String {
        format!("{}{remote_key}", self.prefix)
    }

    fn record(operation: &str, start: Instant, result: Result<(), &BackendError>) {
        metrics::record_backend_operation(
            BackendKind::CloudSecretsManager,
            operation,
            start.elapsed().as_secs_f64(),
        );
        if let Err(e) = result {
            metrics::increment_backend_operation_errors(BackendKind::CloudSecretsManager, e.reason());
        }
    }
}

/// Map an SDK error onto the backend error taxonomy
fn classify<E>(err: &SdkError<E, HttpResponse>, key: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err {
        SdkError::ServiceError(service) => {
            let code = service.err().code().unwrap_or_default();
            if code == "ResourceNotFoundException" {
                BackendError::not_found(key)
            } else if AUTH_ERROR_CODES.contains(&code) {
                BackendError::AuthError(format!("{code}: {}", service.err().message().unwrap_or_default()))
            } else {
                BackendError::Unreachable(DisplayErrorContext(err).to_string())
            }
        }
        _ => BackendError::Unreachable(DisplayErrorContext(err).to_string()),
    }
}

#[async_trait]
impl SecretBackend for AwsSecretsManagerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudSecretsManager
    }

    async fn fetch(
        &self,
        remote_key: &str,
        property: Option<&str>,
    ) -> Result<ResolvedSecretValue, BackendError> {
        let secret_id = self.qualified(remote_key);
        let span = debug_span!("aws.secret.get", secret.name = %secret_id, region = %self.region);
        let start = Instant::now();

        let result: Result<ResolvedSecretValue, BackendError> = async {
            let response = self
                .client
                .get_secret_value()
                .secret_id(&secret_id)
                .send()
                .await
                .map_err(|e| classify(&e, remote_key))?;

            let payload = if let Some(s) = response.secret_string() {
                s.as_bytes().to_vec()
            } else if let Some(blob) = response.secret_binary() {
                blob.as_ref().to_vec()
            } else {
                return Err(BackendError::not_found(remote_key));
            };

            let value = select_property(remote_key, &payload, property)?;
            Ok(ResolvedSecretValue::new(
                remote_key,
                property.map(ToString::to_string),
                value,
                response.version_id().map(ToString::to_string),
            ))
        }
        .instrument(span)
        .await;

        Self::record("get", start, result.as_ref().map(|_| ()));
        result
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let qualified_prefix = self.qualified(prefix);
        let start = Instant::now();

        let result: Result<Vec<String>, BackendError> = async {
            let mut names = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let filter = Filter::builder()
                    .key(FilterNameStringType::Name)
                    .values(&qualified_prefix)
                    .build();
                let response = self
                    .client
                    .list_secrets()
                    .filters(filter)
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .map_err(|e| classify(&e, prefix))?;

                names.extend(
                    response
                        .secret_list()
                        .iter()
                        .filter_map(|entry| entry.name())
                        .filter(|name| name.starts_with(&qualified_prefix))
                        .filter_map(|name| name.strip_prefix(&self.prefix))
                        .map(ToString::to_string),
                );

                match response.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
            names.sort();
            debug!(prefix = %qualified_prefix, count = names.len(), "Listed AWS secrets");
            Ok(names)
        }
        .instrument(debug_span!("aws.secret.list", prefix = %qualified_prefix))
        .await;

        Self::record("list", start, result.as_ref().map(|_| ()));
        result
    }

    async fn health_check(&self) -> HealthStatus {
        match self.client.list_secrets().max_results(1).send().await {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => {
                warn!(region = %self.region, error = %DisplayErrorContext(&e), "AWS Secrets Manager health check failed");
                HealthStatus::Unreachable
            }
        }
    }
}
