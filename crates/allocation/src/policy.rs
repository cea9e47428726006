use chrono::{DateTime, Utc};
use uuid::Uuid;

use seatflow_core::ProductId;

/// Inputs of one optimization run besides the inventory itself.
///
/// `reference_time` and `run_id` are explicit so that identical policies give
/// identical plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationPolicy {
    /// Reclaim everything from users inactive for more than this many days.
    pub reclaim_days: u32,
    /// Downgrade multi-product users inactive for more than this many days.
    pub downgrade_days: u32,
    /// Users holding more products than this are downgrade candidates.
    pub max_products_before_downgrade: usize,
    /// Product granted to waiting users by `Reassign`. `None` disables reassignment.
    pub default_product: Option<ProductId>,
    pub reference_time: DateTime<Utc>,
    /// Namespace for deterministic action ids.
    pub run_id: Uuid,
    /// Sequence number of the first emitted action.
    pub first_sequence: u64,
}

impl OptimizationPolicy {
    pub fn new(reference_time: DateTime<Utc>) -> Self {
        Self {
            reclaim_days: 60,
            downgrade_days: 15,
            max_products_before_downgrade: 2,
            default_product: None,
            reference_time,
            run_id: Uuid::now_v7(),
            first_sequence: 1,
        }
    }

    pub fn with_default_product(mut self, product: ProductId) -> Self {
        self.default_product = Some(product);
        self
    }

    pub fn with_thresholds(
        mut self,
        reclaim_days: u32,
        downgrade_days: u32,
        max_products_before_downgrade: usize,
    ) -> Self {
        self.reclaim_days = reclaim_days;
        self.downgrade_days = downgrade_days;
        self.max_products_before_downgrade = max_products_before_downgrade;
        self
    }

    pub fn with_run(mut self, run_id: Uuid, first_sequence: u64) -> Self {
        self.run_id = run_id;
        self.first_sequence = first_sequence;
        self
    }
}
