//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use secret_sync_controller::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Domain model
pub use crate::controller::descriptor::{
    CreationPolicy, DataFromSource, FieldMapping, ObjectIdentity, RemoteRef, SecretDescriptor,
    SyncPhase, SyncStatus, TemplateSpec,
};
pub use crate::controller::registry::{Change, DescriptorRegistry, RegistryError};

// Reconciliation
pub use crate::controller::reconciler::{
    PassOutcome, PassReport, ReconcileSettings, Reconciler, StatusSink, SyncError,
};
pub use crate::controller::scheduler::{Scheduler, TriggerResult};

// Backend and store traits - needed for implementing adapters
pub use crate::provider::pool::BackendPool;
pub use crate::provider::{BackendError, BackendId, BackendKind, HealthStatus, SecretBackend};
pub use crate::store::{StoreAdapter, StoreError};

pub use crate::config::ControllerConfig;
