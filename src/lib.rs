//! # Secret Sync Controller
//!
//! A Kubernetes controller that mirrors secret material from external backends
//! (Vault-like KV engines, AWS Secrets Manager) into Kubernetes `Secret`s.
//!
//! ## Overview
//!
//! 1. **Backends** - `SecretStore` / `ClusterSecretStore` resources define where secrets live
//! 2. **Descriptors** - `ExternalSecret` resources say which remote keys map to which `Secret` keys
//! 3. **Reconciliation** - each descriptor is fetched, rendered, diffed and applied on its refresh interval
//! 4. **Ownership** - a destination `Secret` carries an owner marker naming the descriptor that wrote it
//!
//! ## Quick Start
//!
//! ```rust
//! use secret_sync_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod provider;
pub mod runtime;
pub mod server;
pub mod store;
