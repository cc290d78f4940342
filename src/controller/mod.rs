//! # Controller
//!
//! Core domain of the Secret Sync Controller.
//!
//! - `descriptor`: desired-state model and its invariants
//! - `duration`: Kubernetes-style duration parsing for refresh intervals
//! - `backoff`: exponential error backoff
//! - `template`: placeholder renderer for `target.template.body`
//! - `payload`: resolved values, rendered payloads and content hashing
//! - `registry`: in-memory descriptor index
//! - `reconciler`: one fetch, render, diff and apply pass
//! - `scheduler`: timers, trigger coalescing and the worker pool

pub mod backoff;
pub mod descriptor;
pub mod duration;
pub mod payload;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod template;
