//! Pool compliance checks: over-deployment and seat-count drift.

use std::collections::HashMap;

use serde::Serialize;

use seatflow_core::{Money, ProductId};

use crate::model::{InventoryModel, InventorySnapshot};
use crate::user::UserStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    /// More seats in use than purchased.
    OverDeployment { excess: i64 },
    /// Pool counter disagrees with the number of active holders.
    SeatDrift { recorded: i64, holders: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceIssue {
    pub product: ProductId,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: IssueKind,
    /// Monthly cost exposure.
    pub cost_impact: Money,
}

pub fn check_compliance(snapshot: &InventorySnapshot) -> Vec<ComplianceIssue> {
    let mut holders: HashMap<&ProductId, i64> = HashMap::new();
    for user in snapshot.users.iter().filter(|u| u.status == UserStatus::Active) {
        for product in &user.products {
            *holders.entry(product).or_default() += 1;
        }
    }

    let mut issues = Vec::new();
    for pool in &snapshot.pools {
        let id = pool.product_id();
        if pool.used_seats > pool.total_seats {
            let excess = pool.used_seats - pool.total_seats;
            issues.push(ComplianceIssue {
                product: id.clone(),
                severity: Severity::High,
                kind: IssueKind::OverDeployment { excess },
                cost_impact: pool.product.cost_per_seat.times(excess),
            });
        }

        let active = holders.get(id).copied().unwrap_or(0);
        if active != pool.used_seats {
            issues.push(ComplianceIssue {
                product: id.clone(),
                severity: Severity::Low,
                kind: IssueKind::SeatDrift {
                    recorded: pool.used_seats,
                    holders: active,
                },
                cost_impact: pool
                    .product
                    .cost_per_seat
                    .times((pool.used_seats - active).max(0)),
            });
        }
    }
    issues
}

impl InventoryModel {
    /// Pools whose `used` counter differs from the number of active holders.
    ///
    /// Only meaningful while no reservation is outstanding.
    pub fn seat_discrepancies(&self) -> Vec<ComplianceIssue> {
        check_compliance(&self.snapshot())
            .into_iter()
            .filter(|i| matches!(i.kind, IssueKind::SeatDrift { .. }))
            .collect()
    }
}
