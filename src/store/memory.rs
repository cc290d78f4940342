//! In-process store with the same write semantics as the Kubernetes adapter.
//!
//! Tokens are monotonic integers. Write counters and conflict injection make
//! it suitable for exercising the reconciliation engine without a cluster.

use crate::controller::descriptor::ObjectIdentity;
use crate::controller::payload::{RenderedPayload, WriteMode};
use crate::store::{
    next_content_hashes, ConcurrencyToken, StoreAdapter, StoreError, StoreObjectHandle,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A stored object as the memory store keeps it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub secret_type: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub owner: Option<ObjectIdentity>,
    pub content_hashes: BTreeMap<String, String>,
    pub token: u64,
}

impl StoredObject {
    fn handle(&self, identity: &ObjectIdentity) -> StoreObjectHandle {
        StoreObjectHandle {
            identity: identity.clone(),
            token: ConcurrencyToken(self.token.to_string()),
            secret_type: self.secret_type.clone(),
            owner: self.owner.clone(),
            content_hashes: self.content_hashes.clone(),
            keys: self.data.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectIdentity, StoredObject>>,
    next_token: AtomicU64,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ObjectIdentity, StoredObject>>, StoreError> {
        self.objects
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Place an `Opaque` object directly, as another writer would
    pub fn insert(
        &self,
        identity: ObjectIdentity,
        owner: Option<ObjectIdentity>,
        data: BTreeMap<String, Vec<u8>>,
    ) {
        self.insert_typed(identity, "Opaque", owner, data);
    }

    /// Place an object of `secret_type` directly
    pub fn insert_typed(
        &self,
        identity: ObjectIdentity,
        secret_type: &str,
        owner: Option<ObjectIdentity>,
        data: BTreeMap<String, Vec<u8>>,
    ) {
        let object = StoredObject {
            secret_type: secret_type.to_string(),
            data,
            owner,
            content_hashes: BTreeMap::new(),
            token: self.token(),
        };
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(identity, object);
        }
    }

    #[must_use]
    pub fn object(&self, identity: &ObjectIdentity) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(identity).cloned()
    }

    /// Make the next `count` updates fail with `Conflict`
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Creates plus updates
    #[must_use]
    pub fn writes(&self) -> usize {
        self.creates() + self.updates()
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(&self, identity: &ObjectIdentity) -> Result<StoreObjectHandle, StoreError> {
        self.lock()?
            .get(identity)
            .map(|object| object.handle(identity))
            .ok_or(StoreError::NotFound)
    }

    async fn create(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
    ) -> Result<StoreObjectHandle, StoreError> {
        let mut objects = self.lock()?;
        if objects.contains_key(identity) {
            return Err(StoreError::Conflict);
        }
        let object = StoredObject {
            secret_type: payload.secret_type.clone(),
            data: payload.data().clone(),
            owner: Some(payload.owner.clone()),
            content_hashes: next_content_hashes(&BTreeMap::new(), payload),
            token: self.token(),
        };
        let handle = object.handle(identity);
        objects.insert(identity.clone(), object);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn update(
        &self,
        identity: &ObjectIdentity,
        payload: &RenderedPayload,
        token: &ConcurrencyToken,
    ) -> Result<StoreObjectHandle, StoreError> {
        let mut objects = self.lock()?;
        let next_token = self.token();
        let object = objects.get_mut(identity).ok_or(StoreError::NotFound)?;

        if self.take_injected_conflict() {
            // Simulate another writer getting in first
            object.token = next_token;
            return Err(StoreError::Conflict);
        }
        if object.token.to_string() != token.0 {
            return Err(StoreError::Conflict);
        }

        match payload.mode {
            WriteMode::Replace => {
                if object.secret_type != payload.secret_type {
                    return Err(StoreError::TypeChange {
                        existing: object.secret_type.clone(),
                        requested: payload.secret_type.clone(),
                    });
                }
                object.data = payload.data().clone();
                object.owner = Some(payload.owner.clone());
            }
            WriteMode::MergeFields => {
                for (key, value) in payload.data() {
                    object.data.insert(key.clone(), value.clone());
                }
            }
        }
        object.content_hashes = next_content_hashes(&object.content_hashes, payload);
        object.token = next_token;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(object.handle(identity))
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), StoreError> {
        self.lock()?
            .remove(identity)
            .map(|_| {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or(StoreError::NotFound)
    }
}
