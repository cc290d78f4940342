//! Destination cleanup when a descriptor is removed.
//!
//! Only policy Owner deletes, and only while the owner marker still names the
//! removed descriptor. Merge and None leave the object untouched.

use crate::controller::descriptor::{CreationPolicy, SecretDescriptor};
use crate::store::{StoreAdapter, StoreError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

async fn within<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_elapsed| {
            Err(StoreError::Unavailable(format!(
                "store call timed out after {timeout:?}"
            )))
        })
}

/// Delete the destination object of a removed descriptor if it owns it
///
/// Returns whether an object was deleted.
///
/// # Errors
/// Any store failure other than the object already being gone.
pub async fn cleanup_target(
    store: &dyn StoreAdapter,
    descriptor: &SecretDescriptor,
    timeout: Duration,
) -> Result<bool, StoreError> {
    if descriptor.creation_policy != CreationPolicy::Owner {
        debug!(
            descriptor = %descriptor.id,
            policy = descriptor.creation_policy.as_str(),
            "Leaving destination object in place"
        );
        return Ok(false);
    }

    let handle = match within(timeout, store.get(&descriptor.target)).await {
        Ok(handle) => handle,
        Err(StoreError::NotFound) => return Ok(false),
        Err(e) => return Err(e),
    };

    if handle.owner.as_ref() != Some(&descriptor.id) {
        warn!(
            descriptor = %descriptor.id,
            target = %descriptor.target,
            owner = ?handle.owner.as_ref().map(ToString::to_string),
            "Destination object is not owned by the removed descriptor, leaving it in place"
        );
        return Ok(false);
    }

    match within(timeout, store.delete(&descriptor.target)).await {
        Ok(()) => {
            info!(descriptor = %descriptor.id, target = %descriptor.target, "🗑️ Deleted owned Secret");
            Ok(true)
        }
        Err(StoreError::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}
