//! # Descriptor Registry
//!
//! In-memory index of desired-state descriptors keyed by identity.
//!
//! Readers take a shared lock and receive clones; every mutation goes through
//! [`DescriptorRegistry::mutate`], so writers are serialized on one path.
//! A poisoned lock means the index can no longer be trusted and is reported
//! as [`RegistryError::Poisoned`], the only error the controller treats as fatal.

use crate::controller::descriptor::{
    DescriptorError, DescriptorStatus, ObjectIdentity, SecretDescriptor, SyncPhase, SyncStatus,
};
use crate::provider::BackendId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("descriptor registry lock is poisoned")]
    Poisoned,
    #[error("invalid descriptor: {0}")]
    Invalid(#[from] DescriptorError),
}

/// What an upsert did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated {
        /// Mappings, template, backend, target or policy changed
        spec_changed: bool,
        interval_changed: bool,
    },
    Unchanged,
}

impl Change {
    /// Whether the change warrants an immediate out-of-cycle pass
    #[must_use]
    pub fn requires_resync(&self) -> bool {
        match self {
            Change::Added => true,
            Change::Updated {
                spec_changed,
                interval_changed,
            } => *spec_changed || *interval_changed,
            Change::Unchanged => false,
        }
    }
}

/// Outcome of one pass as recorded on the descriptor
#[derive(Debug, Clone)]
pub enum Outcome {
    Synced {
        at: DateTime<Utc>,
        content_hash: String,
    },
    Failed {
        reason: &'static str,
        message: String,
    },
}

#[derive(Debug)]
pub struct DescriptorRegistry {
    descriptors: RwLock<HashMap<ObjectIdentity, SecretDescriptor>>,
    min_refresh_interval: Duration,
}

impl DescriptorRegistry {
    #[must_use]
    pub fn new(min_refresh_interval: Duration) -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
            min_refresh_interval,
        }
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut HashMap<ObjectIdentity, SecretDescriptor>) -> T,
    ) -> Result<T, RegistryError> {
        let mut guard = self
            .descriptors
            .write()
            .map_err(|_poisoned| RegistryError::Poisoned)?;
        Ok(f(&mut guard))
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&HashMap<ObjectIdentity, SecretDescriptor>) -> T,
    ) -> Result<T, RegistryError> {
        let guard = self
            .descriptors
            .read()
            .map_err(|_poisoned| RegistryError::Poisoned)?;
        Ok(f(&guard))
    }

    /// Add a descriptor or replace an existing one in place
    ///
    /// Status is carried over from the existing entry, except that a change to
    /// anything shaping the payload resets it to Pending.
    ///
    /// # Errors
    /// `RegistryError::Invalid` if the descriptor violates its invariants,
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn upsert(&self, mut descriptor: SecretDescriptor) -> Result<Change, RegistryError> {
        descriptor.validate(self.min_refresh_interval)?;

        self.mutate(|map| match map.get_mut(&descriptor.id) {
            None => {
                debug!(descriptor = %descriptor.id, "Registering descriptor");
                descriptor.status = DescriptorStatus::default();
                map.insert(descriptor.id.clone(), descriptor);
                Change::Added
            }
            Some(existing) => {
                let spec_changed = existing.spec_differs(&descriptor);
                let interval_changed = existing.refresh_interval != descriptor.refresh_interval;
                if !spec_changed && !interval_changed {
                    return Change::Unchanged;
                }

                descriptor.status = if spec_changed {
                    DescriptorStatus::default()
                } else {
                    existing.status.clone()
                };
                debug!(
                    descriptor = %descriptor.id,
                    spec_changed,
                    interval_changed,
                    "Updating descriptor"
                );
                *existing = descriptor;
                Change::Updated {
                    spec_changed,
                    interval_changed,
                }
            }
        })
    }

    /// Remove a descriptor, returning it if it was registered
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn remove(&self, id: &ObjectIdentity) -> Result<Option<SecretDescriptor>, RegistryError> {
        self.mutate(|map| map.remove(id))
    }

    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn get(&self, id: &ObjectIdentity) -> Result<Option<SecretDescriptor>, RegistryError> {
        self.read(|map| map.get(id).cloned())
    }

    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn contains(&self, id: &ObjectIdentity) -> Result<bool, RegistryError> {
        self.read(|map| map.contains_key(id))
    }

    /// Identities of all registered descriptors, sorted
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn ids(&self) -> Result<Vec<ObjectIdentity>, RegistryError> {
        self.read(|map| {
            let mut ids: Vec<_> = map.keys().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Descriptors reading from `backend`, sorted
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn ids_for_backend(&self, backend: &BackendId) -> Result<Vec<ObjectIdentity>, RegistryError> {
        self.read(|map| {
            let mut ids: Vec<_> = map
                .values()
                .filter(|d| &d.backend == backend)
                .map(|d| d.id.clone())
                .collect();
            ids.sort();
            ids
        })
    }

    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn len(&self) -> Result<usize, RegistryError> {
        self.read(HashMap::len)
    }

    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        self.read(HashMap::is_empty)
    }

    /// Move a descriptor to `phase`
    ///
    /// Returns `false` if the descriptor is gone or the transition is not legal.
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn set_phase(&self, id: &ObjectIdentity, phase: SyncPhase) -> Result<bool, RegistryError> {
        self.mutate(|map| match map.get_mut(id) {
            Some(descriptor) if descriptor.status.phase.can_transition_to(phase) => {
                descriptor.status.phase = phase;
                true
            }
            _ => false,
        })
    }

    /// Enter Fetching at the start of a pass
    ///
    /// Overrides whatever phase a cancelled pass left behind. Returns `false`
    /// if the descriptor is gone.
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn begin_pass(&self, id: &ObjectIdentity) -> Result<bool, RegistryError> {
        self.mutate(|map| {
            let Some(descriptor) = map.get_mut(id) else {
                return false;
            };
            descriptor.status.phase = SyncPhase::Fetching;
            true
        })
    }

    /// Record the result of a pass and return the updated status
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the index is corrupted.
    pub fn record_outcome(
        &self,
        id: &ObjectIdentity,
        outcome: Outcome,
    ) -> Result<Option<DescriptorStatus>, RegistryError> {
        self.mutate(|map| {
            let descriptor = map.get_mut(id)?;
            let status = &mut descriptor.status;
            match outcome {
                Outcome::Synced { at, content_hash } => {
                    status.phase = SyncPhase::Synced;
                    status.last_sync_status = SyncStatus::Synced;
                    status.last_sync_time = Some(at);
                    status.last_error_reason = None;
                    status.last_error = None;
                    status.content_hash = Some(content_hash);
                }
                Outcome::Failed { reason, message } => {
                    status.phase = SyncPhase::Error;
                    status.last_sync_status = SyncStatus::Error;
                    status.last_error_reason = Some(reason.to_string());
                    status.last_error = Some(message);
                }
            }
            Some(status.clone())
        })
    }
}
