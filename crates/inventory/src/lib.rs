//! License inventory domain module.
//!
//! This crate contains the in-memory inventory of products, seat pools and
//! license holders, plus the pure activity classifier that feeds the
//! allocation optimizer (no IO, no HTTP, no storage).

pub mod activity;
pub mod compliance;
pub mod model;
pub mod pool;
pub mod product;
pub mod user;

pub use activity::{
    ActivityReport, ActivityThresholds, ActivityTier, DepartmentActivity, InactivityAge,
    PoolUtilization, activity_report, classify, inactivity_age,
};
pub use compliance::{ComplianceIssue, IssueKind, Severity, check_compliance};
pub use model::{InventoryError, InventoryModel, InventorySnapshot, SeatReservation, validate_parts};
pub use pool::{LicensePool, PoolSnapshot};
pub use product::{Product, ProductCategory};
pub use user::{User, UserState, UserStatus};
