//! # Diffing
//!
//! Decides what to do with the destination object for a rendered payload.
//!
//! | Destination | Policy | Plan |
//! |---|---|---|
//! | absent | None | `NotFoundAndCreationForbidden` |
//! | absent | Owner, Merge | create |
//! | owned by another descriptor | Owner, None | `OwnershipConflict` |
//! | hash for this descriptor matches | any | unchanged |
//! | declared type differs | Owner | delete and recreate |
//! | declared type differs | None | `SecretTypeMismatch` |
//! | otherwise | any | update with the object's concurrency token |
//!
//! An object without an owner marker is adopted. Merge never changes the
//! type of an existing object.

use crate::controller::descriptor::{CreationPolicy, SecretDescriptor};
use crate::controller::payload::{RenderedPayload, WriteMode};
use crate::controller::reconciler::types::SyncError;
use crate::store::{ConcurrencyToken, StoreObjectHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum WritePlan {
    Create,
    Update(ConcurrencyToken),
    /// The type cannot be changed in place
    Recreate,
    Unchanged,
}

pub(super) fn plan(
    descriptor: &SecretDescriptor,
    payload: &RenderedPayload,
    existing: Option<&StoreObjectHandle>,
) -> Result<WritePlan, SyncError> {
    let Some(existing) = existing else {
        return match descriptor.creation_policy {
            CreationPolicy::None => Err(SyncError::NotFoundAndCreationForbidden(
                descriptor.target.clone(),
            )),
            CreationPolicy::Owner | CreationPolicy::Merge => Ok(WritePlan::Create),
        };
    };

    if descriptor.creation_policy != CreationPolicy::Merge {
        if let Some(owner) = existing.foreign_owner(&descriptor.id) {
            return Err(SyncError::OwnershipConflict {
                target: descriptor.target.clone(),
                owner: owner.clone(),
            });
        }
    }

    if existing.content_hash_for(&descriptor.id) == Some(payload.content_hash()) {
        return Ok(WritePlan::Unchanged);
    }
    if payload.mode == WriteMode::Replace && existing.secret_type != payload.secret_type {
        return match descriptor.creation_policy {
            CreationPolicy::Owner => Ok(WritePlan::Recreate),
            CreationPolicy::Merge | CreationPolicy::None => Err(SyncError::SecretTypeMismatch {
                target: descriptor.target.clone(),
                existing: existing.secret_type.clone(),
                requested: payload.secret_type.clone(),
            }),
        };
    }
    Ok(WritePlan::Update(existing.token.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::descriptor::tests::descriptor;
    use crate::controller::descriptor::ObjectIdentity;
    use std::collections::BTreeMap;

    fn payload() -> RenderedPayload {
        RenderedPayload::new(
            ObjectIdentity::new("default", "db"),
            "Opaque",
            WriteMode::Replace,
            BTreeMap::from([("username".to_string(), b"admin".to_vec())]),
        )
    }

    fn handle(owner: Option<&str>, hash: Option<&str>) -> StoreObjectHandle {
        StoreObjectHandle {
            identity: ObjectIdentity::new("default", "db"),
            token: ConcurrencyToken("7".to_string()),
            secret_type: "Opaque".to_string(),
            owner: owner.map(|o| ObjectIdentity::new("default", o)),
            content_hashes: hash
                .map(|h| BTreeMap::from([("default/db".to_string(), h.to_string())]))
                .unwrap_or_default(),
            keys: vec!["username".to_string()],
        }
    }

    #[test]
    fn test_absent_target() {
        let mut d = descriptor("db");
        assert_eq!(plan(&d, &payload(), None).unwrap(), WritePlan::Create);

        d.creation_policy = CreationPolicy::None;
        assert_eq!(
            plan(&d, &payload(), None).unwrap_err().reason(),
            "NotFoundAndCreationForbidden"
        );
    }

    #[test]
    fn test_foreign_owner() {
        let mut d = descriptor("db");
        let existing = handle(Some("other"), None);
        assert_eq!(
            plan(&d, &payload(), Some(&existing)).unwrap_err().reason(),
            "OwnershipConflict"
        );

        d.creation_policy = CreationPolicy::Merge;
        assert_eq!(
            plan(&d, &payload(), Some(&existing)).unwrap(),
            WritePlan::Update(ConcurrencyToken("7".to_string()))
        );
    }

    #[test]
    fn test_matching_hash_is_unchanged() {
        let d = descriptor("db");
        let p = payload();
        let existing = handle(Some("db"), Some(p.content_hash()));
        assert_eq!(plan(&d, &p, Some(&existing)).unwrap(), WritePlan::Unchanged);

        let stale = handle(None, Some("old"));
        assert!(matches!(
            plan(&d, &p, Some(&stale)).unwrap(),
            WritePlan::Update(_)
        ));
    }

    #[test]
    fn test_type_change() {
        let mut d = descriptor("db");
        let mut existing = handle(None, None);
        existing.secret_type = "kubernetes.io/basic-auth".to_string();
        assert_eq!(plan(&d, &payload(), Some(&existing)).unwrap(), WritePlan::Recreate);

        d.creation_policy = CreationPolicy::None;
        assert_eq!(
            plan(&d, &payload(), Some(&existing)).unwrap_err().reason(),
            "SecretTypeMismatch"
        );
    }
}
