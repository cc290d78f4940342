//! # Status
//!
//! Status subresources for `ExternalSecret` and the store resources.

use crate::controller::descriptor::{DescriptorStatus, SyncStatus};
use serde::{Deserialize, Serialize};

/// Status of an `ExternalSecret`
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretStatus {
    /// Pending, Synced or Error
    #[serde(default)]
    pub phase: Option<String>,
    /// Stable reason code of the last failure
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message of the last failure
    #[serde(default)]
    pub message: Option<String>,
    /// Last successful sync (RFC3339)
    #[serde(default)]
    pub last_sync_time: Option<String>,
    /// Content hash of the last written payload
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ExternalSecretStatus {
    /// Build the published status from the registry's view of a descriptor
    #[must_use]
    pub fn from_descriptor(status: &DescriptorStatus, observed_generation: Option<i64>) -> Self {
        let (ready, reason) = match status.last_sync_status {
            SyncStatus::Synced => ("True", "SecretSynced"),
            SyncStatus::Error => (
                "False",
                status.last_error_reason.as_deref().unwrap_or("SyncFailed"),
            ),
            SyncStatus::Pending => ("False", "Pending"),
        };

        Self {
            phase: Some(status.last_sync_status.as_str().to_string()),
            reason: status.last_error_reason.clone(),
            message: status.last_error.clone(),
            last_sync_time: status.last_sync_time.map(|t| t.to_rfc3339()),
            content_hash: status.content_hash.clone(),
            observed_generation,
            conditions: vec![Condition {
                r#type: "Ready".to_string(),
                status: ready.to_string(),
                last_transition_time: None,
                reason: Some(reason.to_string()),
                message: status.last_error.clone(),
            }],
        }
    }

    /// Equality ignoring condition transition times
    #[must_use]
    pub fn same_state(&self, other: &ExternalSecretStatus) -> bool {
        let strip = |s: &ExternalSecretStatus| {
            let mut s = s.clone();
            for condition in &mut s.conditions {
                condition.last_transition_time = None;
            }
            s
        };
        strip(self) == strip(other)
    }
}

/// Status of a `SecretStore` or `ClusterSecretStore`
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreStatus {
    /// Unknown, Healthy or Unreachable
    #[serde(default)]
    pub health: Option<String>,
    /// Last health check (RFC3339)
    #[serde(default)]
    pub last_checked: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
