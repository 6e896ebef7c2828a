//! Error handling for the UI update agent
//!
//! Every failure the agent can report is a variant of [`UiUpdateError`].
//! Coordination-service failures keep the service's result code in a
//! [`ZkErrorCode`] so callers can branch on `NoNode`, `NodeExists` or
//! `BadVersion` without string matching.
//!
//! ## Propagation
//!
//! - Transient coordination failures inside watchers are retried with backoff
//!   and never surface to callers.
//! - Filesystem and registry failures during an operation become a `Failed`
//!   per-node status.
//! - Leader-side CAS failures are retried a few times before the operation
//!   escalates to `Failed`.

pub mod conversions;
pub mod types;

pub use types::{Result, UiUpdateError, UiUpdateResult, ZkErrorCode};
