//! # Secret Descriptors
//!
//! Desired-state records for synchronized secrets, derived from `ExternalSecret`
//! resources. A descriptor names the backend to read from, which remote
//! values to fetch, how to shape them (plain mapping or template) and where
//! to write the result.

use crate::provider::BackendId;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Namespaced identity of a descriptor or a destination object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse the `namespace/name` form written into owner annotations
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Remote coordinates of a single value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub key: String,
    pub property: Option<String>,
}

/// Maps one local key of the destination object to a remote value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub secret_key: String,
    pub remote_ref: RemoteRef,
}

/// Bulk sources that expand into several local keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFromSource {
    /// Fetch one remote JSON object and spread its top-level properties
    Extract { key: String },
    /// List remote keys under a prefix and store each under its last path segment
    Find { prefix: String },
}

/// Template producing a single blob in the destination object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    /// Raw template text with `{{ .field }}` placeholders
    pub body: String,
    /// Declared type of the destination object (Kubernetes Secret `type`)
    pub secret_type: String,
    /// Key the rendered blob is stored under
    pub key: String,
}

/// Governs whether the controller may create, merge into, or must never create
/// the destination object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreationPolicy {
    #[default]
    Owner,
    Merge,
    None,
}

impl CreationPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationPolicy::Owner => "Owner",
            CreationPolicy::Merge => "Merge",
            CreationPolicy::None => "None",
        }
    }
}

/// Last recorded outcome of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "Pending",
            SyncStatus::Synced => "Synced",
            SyncStatus::Error => "Error",
        }
    }
}

/// Reconciliation state machine
///
/// Pending -> Fetching -> Rendering -> Diffing -> Applying -> Synced, with any
/// state able to move to Error, and Error/Synced returning to Pending when the
/// next pass is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Pending,
    Fetching,
    Rendering,
    Diffing,
    Applying,
    Synced,
    Error,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Pending => "Pending",
            SyncPhase::Fetching => "Fetching",
            SyncPhase::Rendering => "Rendering",
            SyncPhase::Diffing => "Diffing",
            SyncPhase::Applying => "Applying",
            SyncPhase::Synced => "Synced",
            SyncPhase::Error => "Error",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::{Applying, Diffing, Error, Fetching, Pending, Rendering, Synced};
        match (self, next) {
            (_, Error) => true,
            (Pending, Fetching)
            | (Fetching, Rendering)
            | (Rendering, Diffing)
            | (Diffing, Applying | Synced)
            | (Applying, Synced)
            | (Synced | Error, Pending) => true,
            _ => false,
        }
    }
}

/// Observed state recorded back onto a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorStatus {
    pub phase: SyncPhase,
    pub last_sync_status: SyncStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Stable reason code of the last failure
    pub last_error_reason: Option<String>,
    pub last_error: Option<String>,
    /// Content hash of the last applied (or confirmed) payload
    pub content_hash: Option<String>,
}

/// Desired state for one synchronized secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDescriptor {
    pub id: ObjectIdentity,
    pub backend: BackendId,
    /// Ordered field mappings; keys are unique
    pub mappings: Vec<FieldMapping>,
    pub data_from: Vec<DataFromSource>,
    pub template: Option<TemplateSpec>,
    pub refresh_interval: Duration,
    pub creation_policy: CreationPolicy,
    /// Destination object (same namespace as the descriptor)
    pub target: ObjectIdentity,
    pub status: DescriptorStatus,
}

/// Descriptor validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("duplicate secretKey '{0}' in field mappings")]
    DuplicateKey(String),
    #[error("field mapping has an empty secretKey")]
    EmptySecretKey,
    #[error("field mapping '{0}' has an empty remote key")]
    EmptyRemoteKey(String),
    #[error("refresh interval must be greater than zero")]
    ZeroRefreshInterval,
    #[error("refresh interval {actual:?} is below the minimum of {minimum:?}")]
    RefreshIntervalTooShort { actual: Duration, minimum: Duration },
    #[error("descriptor has neither field mappings nor a template")]
    NothingToSync,
    #[error("template key must not be empty")]
    EmptyTemplateKey,
}

impl SecretDescriptor {
    /// Check the structural invariants of the descriptor
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self, min_refresh_interval: Duration) -> Result<(), DescriptorError> {
        if self.refresh_interval.is_zero() {
            return Err(DescriptorError::ZeroRefreshInterval);
        }
        if self.refresh_interval < min_refresh_interval {
            return Err(DescriptorError::RefreshIntervalTooShort {
                actual: self.refresh_interval,
                minimum: min_refresh_interval,
            });
        }
        if self.mappings.is_empty() && self.data_from.is_empty() && self.template.is_none() {
            return Err(DescriptorError::NothingToSync);
        }

        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if mapping.secret_key.is_empty() {
                return Err(DescriptorError::EmptySecretKey);
            }
            if mapping.remote_ref.key.is_empty() {
                return Err(DescriptorError::EmptyRemoteKey(mapping.secret_key.clone()));
            }
            if !seen.insert(mapping.secret_key.as_str()) {
                return Err(DescriptorError::DuplicateKey(mapping.secret_key.clone()));
            }
        }

        if let Some(template) = &self.template {
            if template.key.is_empty() {
                return Err(DescriptorError::EmptyTemplateKey);
            }
        }

        Ok(())
    }

    /// Whether the parts that shape the payload differ from `other`
    ///
    /// Status is ignored; a change here resets the descriptor to Pending.
    #[must_use]
    pub fn spec_differs(&self, other: &SecretDescriptor) -> bool {
        self.backend != other.backend
            || self.mappings != other.mappings
            || self.data_from != other.data_from
            || self.template != other.template
            || self.creation_policy != other.creation_policy
            || self.target != other.target
    }

    #[must_use]
    pub fn mapping(&self, secret_key: &str) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.secret_key == secret_key)
    }
}
