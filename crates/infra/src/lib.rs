//! Infrastructure layer: configuration, the remote provisioning client, the
//! durable job queue, the audit ledger, workers and run orchestration.

pub mod config;
pub mod context;
pub mod jobs;
pub mod ledger;
pub mod remote;
pub mod run;
pub mod sync;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use config::{CONFIG_ENV, Config, ConfigError};
pub use context::ProvisioningContext;
pub use ledger::{CommitOutcome, LedgerError, SyncLedger};
pub use run::{BuildError, Orchestrator, RunError, RunSummary, action_priority};
pub use sync::{ReconcileReport, SyncCoordinator, SyncError};
