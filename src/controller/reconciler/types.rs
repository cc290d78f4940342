//! Shared types for the reconciliation engine.

use crate::constants;
use crate::controller::descriptor::ObjectIdentity;
use crate::controller::template::TemplateError;
use crate::provider::{BackendError, BackendId};
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Timeouts and backoff bounds applied to every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Per backend call
    pub fetch_timeout: Duration,
    /// Per store call
    pub store_timeout: Duration,
    /// Whole pass deadline
    pub pass_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(constants::DEFAULT_FETCH_TIMEOUT_SECS),
            store_timeout: Duration::from_secs(constants::DEFAULT_STORE_TIMEOUT_SECS),
            pass_timeout: Duration::from_secs(constants::DEFAULT_PASS_TIMEOUT_SECS),
            backoff_base: Duration::from_secs(constants::DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(constants::DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

/// Why a pass failed
///
/// Every variant is recorded on the descriptor and retried after its backoff
/// delay. [`SyncError::reason`] gives the stable code used in status, logs and
/// metric labels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("target {target} is owned by {owner}")]
    OwnershipConflict {
        target: ObjectIdentity,
        owner: ObjectIdentity,
    },
    #[error("target {0} kept changing during the write, retry scheduled")]
    Conflict(ObjectIdentity),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("target {0} does not exist and creationPolicy is None")]
    NotFoundAndCreationForbidden(ObjectIdentity),
    #[error("target {target} has type {existing}, payload needs {requested}; only creationPolicy Owner recreates it")]
    SecretTypeMismatch {
        target: ObjectIdentity,
        existing: String,
        requested: String,
    },
    #[error("backend {0} is not loaded")]
    BackendNotReady(BackendId),
    #[error("store write failed: {0}")]
    Store(StoreError),
    #[error("pass cancelled")]
    Cancelled,
}

impl SyncError {
    /// Every code [`SyncError::reason`] can return
    pub const REASONS: [&'static str; 14] = [
        "NotFound",
        "AuthError",
        "Unreachable",
        "TemplateSyntaxError",
        "MissingField",
        "TemplateFunctionError",
        "OwnershipConflict",
        "Conflict",
        "Timeout",
        "NotFoundAndCreationForbidden",
        "SecretTypeMismatch",
        "BackendNotReady",
        "StoreError",
        "Cancelled",
    ];

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::Backend(e) => e.reason(),
            SyncError::Template(TemplateError::Syntax { .. }) => "TemplateSyntaxError",
            SyncError::Template(TemplateError::MissingField(_)) => "MissingField",
            SyncError::Template(TemplateError::FunctionFailed { .. }) => "TemplateFunctionError",
            SyncError::OwnershipConflict { .. } => "OwnershipConflict",
            SyncError::Conflict(_) => "Conflict",
            SyncError::Timeout { .. } => "Timeout",
            SyncError::NotFoundAndCreationForbidden(_) => "NotFoundAndCreationForbidden",
            SyncError::SecretTypeMismatch { .. } => "SecretTypeMismatch",
            SyncError::BackendNotReady(_) => "BackendNotReady",
            SyncError::Store(_) => "StoreError",
            SyncError::Cancelled => "Cancelled",
        }
    }
}

/// What a successful pass did to the destination object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Created,
    Updated,
    /// Content hash matched, nothing written
    Unchanged,
}

impl PassOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Created => "created",
            PassOutcome::Updated => "updated",
            PassOutcome::Unchanged => "unchanged",
        }
    }
}

/// Result of one pass as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub result: Result<PassOutcome, SyncError>,
    /// When the next pass is due; `None` when the pass was cancelled or the
    /// descriptor is gone
    pub next_delay: Option<Duration>,
}

impl PassReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_list_is_complete() {
        let target = ObjectIdentity::new("default", "db");
        let errors = [
            SyncError::from(BackendError::not_found("k")),
            SyncError::from(BackendError::AuthError("denied".to_string())),
            SyncError::from(BackendError::Unreachable("down".to_string())),
            SyncError::from(TemplateError::Syntax {
                position: 0,
                message: "bad".to_string(),
            }),
            SyncError::from(TemplateError::MissingField("host".to_string())),
            SyncError::from(TemplateError::FunctionFailed {
                function: "b64dec",
                field: "cert".to_string(),
                reason: "invalid".to_string(),
            }),
            SyncError::OwnershipConflict {
                target: target.clone(),
                owner: ObjectIdentity::new("default", "other"),
            },
            SyncError::Conflict(target.clone()),
            SyncError::Timeout {
                stage: "pass",
                after: Duration::from_secs(1),
            },
            SyncError::NotFoundAndCreationForbidden(target.clone()),
            SyncError::SecretTypeMismatch {
                target,
                existing: "kubernetes.io/tls".to_string(),
                requested: "Opaque".to_string(),
            },
            SyncError::BackendNotReady(BackendId::cluster("aws")),
            SyncError::Store(StoreError::Unavailable("down".to_string())),
            SyncError::Cancelled,
        ];
        let reasons: Vec<_> = errors.iter().map(SyncError::reason).collect();
        assert_eq!(reasons, SyncError::REASONS);
    }

    #[test]
    fn test_reason_codes() {
        let target = ObjectIdentity::new("default", "db");
        assert_eq!(
            SyncError::from(BackendError::AuthError("denied".to_string())).reason(),
            "AuthError"
        );
        assert_eq!(
            SyncError::from(TemplateError::MissingField("host".to_string())).reason(),
            "MissingField"
        );
        assert_eq!(
            SyncError::OwnershipConflict {
                target: target.clone(),
                owner: ObjectIdentity::new("default", "other"),
            }
            .reason(),
            "OwnershipConflict"
        );
        assert_eq!(
            SyncError::NotFoundAndCreationForbidden(target).reason(),
            "NotFoundAndCreationForbidden"
        );
        assert_eq!(
            SyncError::Timeout {
                stage: "pass",
                after: Duration::from_secs(60)
            }
            .reason(),
            "Timeout"
        );
    }
}
