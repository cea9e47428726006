//! Activity classifier: pure inactivity and utilization metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use seatflow_core::{DomainError, ProductId, ValueObject};

use crate::pool::PoolSnapshot;
use crate::user::User;

/// How long a user has gone without using any seat.
///
/// `Never` sorts after every finite age: a user with no recorded activity is
/// treated as maximally inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactivityAge {
    Days(i64),
    Never,
}

impl InactivityAge {
    /// Strictly more than `days` days inactive.
    pub fn exceeds(self, days: u32) -> bool {
        self > InactivityAge::Days(i64::from(days))
    }
}

/// Whole days since `user.last_active`, clamped at zero for timestamps in the
/// future.
pub fn inactivity_age(user: &User, reference: DateTime<Utc>) -> InactivityAge {
    match user.last_active {
        Some(at) => InactivityAge::Days((reference - at).num_days().max(0)),
        None => InactivityAge::Never,
    }
}

/// Activity tier, ordered from most to least active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityTier {
    Active,
    Cooling,
    Idle,
    Inactive,
    Abandoned,
}

/// Day counts at which a user moves into the next tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityThresholds {
    pub cooling_days: u32,
    pub idle_days: u32,
    pub inactive_days: u32,
    pub abandoned_days: u32,
}

impl Default for ActivityThresholds {
    fn default() -> Self {
        Self {
            cooling_days: 15,
            idle_days: 30,
            inactive_days: 60,
            abandoned_days: 90,
        }
    }
}

impl ValueObject for ActivityThresholds {}

impl ActivityThresholds {
    pub fn from_days(days: [u32; 4]) -> Result<Self, DomainError> {
        let t = Self {
            cooling_days: days[0],
            idle_days: days[1],
            inactive_days: days[2],
            abandoned_days: days[3],
        };
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let days = [self.cooling_days, self.idle_days, self.inactive_days, self.abandoned_days];
        if days.windows(2).all(|w| w[0] < w[1]) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "activity tier days must be strictly increasing, got {days:?}"
            )))
        }
    }
}

/// Classify one user against the thresholds. A tier is entered once the
/// inactivity age exceeds its day count.
pub fn classify(
    user: &User,
    reference: DateTime<Utc>,
    thresholds: &ActivityThresholds,
) -> ActivityTier {
    let age = inactivity_age(user, reference);
    if age.exceeds(thresholds.abandoned_days) {
        ActivityTier::Abandoned
    } else if age.exceeds(thresholds.inactive_days) {
        ActivityTier::Inactive
    } else if age.exceeds(thresholds.idle_days) {
        ActivityTier::Idle
    } else if age.exceeds(thresholds.cooling_days) {
        ActivityTier::Cooling
    } else {
        ActivityTier::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentActivity {
    pub total: usize,
    pub inactive: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUtilization {
    pub product: ProductId,
    pub used: i64,
    pub total: i64,
    /// Utilization in basis points (10000 = fully used).
    pub basis_points: i64,
}

/// Usage analysis over a whole snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReport {
    pub total_users: usize,
    pub tiers: BTreeMap<ActivityTier, usize>,
    pub departments: BTreeMap<String, DepartmentActivity>,
    pub utilization: Vec<PoolUtilization>,
}

impl ActivityReport {
    /// Users in the `Inactive` tier or beyond.
    pub fn inactive_users(&self) -> usize {
        self.tiers
            .iter()
            .filter(|(tier, _)| **tier >= ActivityTier::Inactive)
            .map(|(_, n)| n)
            .sum()
    }
}

pub fn activity_report(
    users: &[User],
    pools: &[PoolSnapshot],
    reference: DateTime<Utc>,
    thresholds: &ActivityThresholds,
) -> ActivityReport {
    let mut report = ActivityReport {
        total_users: users.len(),
        ..ActivityReport::default()
    };

    for user in users {
        let tier = classify(user, reference, thresholds);
        *report.tiers.entry(tier).or_default() += 1;

        let dept = report.departments.entry(user.department.clone()).or_default();
        dept.total += 1;
        if tier >= ActivityTier::Inactive {
            dept.inactive += 1;
        }
    }

    report.utilization = pools
        .iter()
        .map(|p| PoolUtilization {
            product: p.product.id.clone(),
            used: p.used_seats,
            total: p.total_seats,
            basis_points: if p.total_seats > 0 {
                p.used_seats * 10_000 / p.total_seats
            } else {
                0
            },
        })
        .collect();

    report
}
