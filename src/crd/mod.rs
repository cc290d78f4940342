//! # Custom Resource Definitions
//!
//! CRD types for the Secret Sync Controller.
//!
//! ## Module Structure
//!
//! - `secret_store.rs` - `SecretStore` / `ClusterSecretStore` (backend definitions)
//! - `external_secret.rs` - `ExternalSecret` (what to sync and where)
//! - `status.rs` - Status types for both
//!
//! Each resource converts into its domain counterpart: stores into
//! [`crate::provider::BackendRef`], external secrets into
//! [`crate::controller::descriptor::SecretDescriptor`].

mod external_secret;
mod secret_store;
mod status;

pub use external_secret::{
    CreationPolicySpec, DataFromSpec, ExternalSecret, ExternalSecretData, ExternalSecretSpec,
    ExternalSecretTarget, ExternalSecretTemplate, ExtractSpec, FindSpec, RemoteRefSpec,
    SecretStoreRef, StoreKind,
};
pub use secret_store::{
    AwsAccessKeysAuth, AwsAuthSpec, AwsProvider, ClusterSecretStore, ClusterSecretStoreSpec,
    ProviderSpec, SecretStore, SecretStoreSpec, VaultAuthSpec, VaultKubernetesAuth, VaultKvVersionSpec,
    VaultProvider, VaultTokenAuth,
};
pub use status::{Condition, ExternalSecretStatus, SecretStoreStatus};
