//! Reconciliation of external state back into the local pipeline.

pub mod coordinator;

pub use coordinator::{ReconcileReport, SyncCoordinator, SyncError};
