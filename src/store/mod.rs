//! # Store Adapters
//!
//! Abstraction over the destination key-value store.
//!
//! - [`kubernetes::KubernetesSecretStore`] writes Kubernetes `Secret` objects
//! - [`memory::MemoryStore`] keeps objects in process, with the same semantics
//!
//! Every object carries an owner marker (the descriptor that created it), a
//! map of content hashes keyed by owner and an optimistic concurrency token.

use crate::controller::descriptor::ObjectIdentity;
use crate::controller::payload::RenderedPayload;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod kubernetes;
pub mod memory;

/// Opaque optimistic concurrency token (Kubernetes `resourceVersion`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyToken(pub String);

impl std::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination-side view of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreObjectHandle {
    pub identity: ObjectIdentity,
    pub token: ConcurrencyToken,
    /// Declared type; fixed once the object exists
    pub secret_type: String,
    /// Descriptor authoritative for the object, if any
    pub owner: Option<ObjectIdentity>,
    /// Content hash last written by each descriptor
    pub content_hashes: BTreeMap<String, String>,
    pub keys: Vec<String>,
}

impl StoreObjectHandle {
    /// Hash last written by `descriptor`
    #[must_use]
    pub fn content_hash_for(&self, descriptor: &ObjectIdentity) -> Option<&str> {
        self.content_hashes
            .get(&descriptor.to_string())
            .map(String::as_str)
    }

    /// Owner marker naming a descriptor other than `descriptor`
    #[must_use]
    pub fn foreign_owner(&self, descriptor: &ObjectIdentity) -> Option<&ObjectIdentity> {
        self.owner.as_ref().filter(|owner| *owner != descriptor)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object was modified concurrently")]
    Conflict,
    #[error("store rejected the request: {0}")]
    Api(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object type cannot change from {existing} to {requested}")]
    TypeChange { existing: String, requested: String },
}

/// Capability interface over the destination store
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// # Errors
    /// `StoreError::NotFound` if the object does not exist.
    async fn get(&self, identity: &ObjectIdentity) -> Result<StoreObjectHandle, StoreError>;

    /// # Errors
    /// `StoreError::Conflict` if the object already exists.
    async fn create(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
    ) -> Result<StoreObjectHandle, StoreError>;

    /// Write `payload` over the object last seen with `token`
    ///
    /// # Errors
    /// `StoreError::Conflict` if the token is stale, `StoreError::NotFound` if
    /// the object was deleted, `StoreError::TypeChange` if a `Replace` payload
    /// declares a different type than the stored object.
    async fn update(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
        token: &ConcurrencyToken,
    ) -> Result<StoreObjectHandle, StoreError>;

    /// # Errors
    /// `StoreError::NotFound` if the object does not exist.
    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), StoreError>;
}

/// Hash map after writing `payload`: Replace keeps only the writer's entry
pub(crate) fn next_content_hashes(
    existing: &BTreeMap<String, String>,
    payload: &RenderedPayload,
) -> BTreeMap<String, String> {
    use crate::controller::payload::WriteMode;

    let mut hashes = match payload.mode {
        WriteMode::Replace => BTreeMap::new(),
        WriteMode::MergeFields => existing.clone(),
    };
    hashes.insert(payload.owner.to_string(), payload.content_hash().to_string());
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::payload::WriteMode;

    fn payload(owner: &str, mode: WriteMode) -> RenderedPayload {
        let data = BTreeMap::from([("k".to_string(), b"v".to_vec())]);
        RenderedPayload::new(ObjectIdentity::new("default", owner), "Opaque", mode, data)
    }

    #[test]
    fn test_next_content_hashes() {
        let existing = BTreeMap::from([("default/other".to_string(), "aaa".to_string())]);

        let replaced = next_content_hashes(&existing, &payload("db", WriteMode::Replace));
        assert_eq!(replaced.len(), 1);
        assert!(replaced.contains_key("default/db"));

        let merged = next_content_hashes(&existing, &payload("db", WriteMode::MergeFields));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("default/other").map(String::as_str), Some("aaa"));
    }

    #[test]
    fn test_foreign_owner() {
        let handle = StoreObjectHandle {
            identity: ObjectIdentity::new("default", "db"),
            token: ConcurrencyToken("1".to_string()),
            secret_type: "Opaque".to_string(),
            owner: Some(ObjectIdentity::new("default", "b")),
            content_hashes: BTreeMap::new(),
            keys: vec![],
        };
        assert_eq!(
            handle.foreign_owner(&ObjectIdentity::new("default", "a")),
            Some(&ObjectIdentity::new("default", "b"))
        );
        assert_eq!(handle.foreign_owner(&ObjectIdentity::new("default", "b")), None);
    }
}
