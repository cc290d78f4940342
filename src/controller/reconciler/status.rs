//! # Status Write-back
//!
//! Publishes descriptor state to the `ExternalSecret` status subresource.
//! The patch is skipped when nothing but transition times would change, so
//! an unchanged pass does not generate a watch event.

use crate::controller::descriptor::{DescriptorStatus, ObjectIdentity};
use crate::crd::{ExternalSecret, ExternalSecretStatus};
use anyhow::Result;
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

/// Destination for descriptor status after every pass
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// # Errors
    /// Returns an error if the status could not be written; callers only log it.
    async fn publish(&self, id: &ObjectIdentity, status: &DescriptorStatus) -> Result<()>;
}

/// Discards status updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn publish(&self, _id: &ObjectIdentity, _status: &DescriptorStatus) -> Result<()> {
        Ok(())
    }
}

/// Writes status onto the `ExternalSecret` the descriptor came from
#[derive(Clone)]
pub struct ExternalSecretStatusSink {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for ExternalSecretStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSecretStatusSink")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl ExternalSecretStatusSink {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

/// Carry transition times over for conditions whose status did not change
fn carry_transition_times(next: &mut ExternalSecretStatus, previous: &ExternalSecretStatus) {
    let now = chrono::Utc::now().to_rfc3339();
    for condition in &mut next.conditions {
        let unchanged = previous
            .conditions
            .iter()
            .find(|p| p.r#type == condition.r#type && p.status == condition.status);
        condition.last_transition_time = match unchanged {
            Some(p) => p.last_transition_time.clone().or_else(|| Some(now.clone())),
            None => Some(now.clone()),
        };
    }
}

#[async_trait]
impl StatusSink for ExternalSecretStatusSink {
    async fn publish(&self, id: &ObjectIdentity, status: &DescriptorStatus) -> Result<()> {
        let api: Api<ExternalSecret> = Api::namespaced(self.client.clone(), &id.namespace);
        let Some(current) = api.get_opt(&id.name).await? else {
            debug!(descriptor = %id, "ExternalSecret is gone, skipping status update");
            return Ok(());
        };

        let mut next = ExternalSecretStatus::from_descriptor(status, current.metadata.generation);
        let previous = current.status.unwrap_or_default();
        if previous.same_state(&next) {
            debug!(descriptor = %id, phase = ?next.phase, "Skipping status update - unchanged");
            return Ok(());
        }
        carry_transition_times(&mut next, &previous);

        let patch = serde_json::json!({ "status": next });
        api.patch_status(
            &id.name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}
