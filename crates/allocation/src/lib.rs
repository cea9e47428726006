//! License allocation domain module.
//!
//! Turns an inventory snapshot into an ordered list of reclaim / downgrade /
//! reassign actions, and applies committed actions back to the live
//! inventory. Deterministic domain logic only (no IO).

pub mod action;
pub mod commit;
pub mod optimizer;
pub mod policy;
pub mod record;

pub use action::{Action, ActionKind, ActionStatus};
pub use commit::{AppliedChange, CommitError, apply};
pub use optimizer::{OptimizationPlan, ValidationError, optimize};
pub use policy::OptimizationPolicy;
pub use record::{SyncOutcome, SyncRecord};
