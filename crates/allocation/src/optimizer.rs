//! Allocation optimizer.
//!
//! Pure and deterministic: the same users, pools and policy always produce the
//! same actions in the same order.
//!
//! 1. Users are ordered inactive-first, then by product count (descending),
//!    then by id, so reclamation frees the most seats early.
//! 2. Each user with products is reclaimed (inactive beyond `reclaim_days`),
//!    downgraded to the first-assigned product (more than
//!    `max_products_before_downgrade` products and inactive beyond
//!    `downgrade_days`), or left alone. Reclaim wins when both apply.
//! 3. Waiting users without products get the default product while the
//!    projected pool (after step 2) has free seats, in id order. A pool using
//!    more seats than it licenses has none until usage drops below capacity.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use seatflow_core::{ActionId, DomainError, Money, ProductId};
use seatflow_inventory::{PoolSnapshot, User, UserStatus, inactivity_age, validate_parts};

use crate::action::{Action, ActionKind};
use crate::policy::OptimizationPolicy;

/// Malformed optimizer input. Aborts the run before any action exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid inventory: {0}")]
    Inventory(#[from] DomainError),
    #[error("default product {0} has no pool")]
    UnknownDefaultProduct(ProductId),
    #[error("invalid policy: {0}")]
    Policy(String),
}

/// Result of one optimization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationPlan {
    pub actions: Vec<Action>,
    /// Σ cost-per-seat of every reclaimed or downgraded seat.
    pub projected_monthly_savings: Money,
    pub users_analyzed: usize,
}

impl OptimizationPlan {
    pub fn count_of(&self, type_name: &str) -> usize {
        self.actions.iter().filter(|a| a.type_name() == type_name).count()
    }
}

pub fn optimize(
    users: &[User],
    pools: &[PoolSnapshot],
    policy: &OptimizationPolicy,
) -> Result<OptimizationPlan, ValidationError> {
    validate_parts(users, pools)?;
    if policy.max_products_before_downgrade == 0 {
        return Err(ValidationError::Policy(
            "max_products_before_downgrade must be at least 1".into(),
        ));
    }
    if let Some(default) = &policy.default_product {
        if !pools.iter().any(|p| p.product_id() == default) {
            return Err(ValidationError::UnknownDefaultProduct(default.clone()));
        }
    }

    let costs: BTreeMap<&ProductId, Money> = pools
        .iter()
        .map(|p| (p.product_id(), p.product.cost_per_seat))
        .collect();
    let mut seats: BTreeMap<&ProductId, ProjectedSeats> = pools
        .iter()
        .map(|p| {
            let projected = ProjectedSeats {
                total: p.total_seats,
                used: p.used_seats,
            };
            (p.product_id(), projected)
        })
        .collect();

    let mut ordered: Vec<&User> = users.iter().collect();
    ordered.sort_by_cached_key(|u| {
        let inactive = inactivity_age(u, policy.reference_time).exceeds(policy.reclaim_days);
        (Reverse(inactive), Reverse(u.product_count()), u.id.clone())
    });

    let mut plan = PlanBuilder::new(policy);

    for user in &ordered {
        if user.products.is_empty() {
            continue;
        }
        let age = inactivity_age(user, policy.reference_time);

        if age.exceeds(policy.reclaim_days) {
            for p in &user.products {
                plan.save(costs.get(p).copied().unwrap_or(Money::ZERO));
                seats.entry(p).or_default().release();
            }
            plan.push(user, ActionKind::Reclaim {
                products: user.products.clone(),
            });
        } else if user.product_count() > policy.max_products_before_downgrade
            && age.exceeds(policy.downgrade_days)
        {
            let (retained, removed) = user.products.split_at(1);
            for p in removed {
                plan.save(costs.get(p).copied().unwrap_or(Money::ZERO));
                seats.entry(p).or_default().release();
            }
            plan.push(user, ActionKind::Downgrade {
                retained: retained[0].clone(),
                products: removed.to_vec(),
            });
        }
    }

    if let Some(default) = &policy.default_product {
        let mut waiting: Vec<&User> = users
            .iter()
            .filter(|u| u.status == UserStatus::Waiting && u.products.is_empty())
            .collect();
        waiting.sort_by(|a, b| a.id.cmp(&b.id));

        for user in waiting {
            if !seats.entry(default).or_default().take() {
                debug!(user = %user.id, product = %default, "no seat left for waiting user");
                break;
            }
            plan.push(user, ActionKind::Reassign {
                products: vec![default.clone()],
            });
        }
    }

    Ok(plan.finish(users.len()))
}

/// Seat counts of one pool as the plan so far leaves them.
#[derive(Debug, Default)]
struct ProjectedSeats {
    total: i64,
    used: i64,
}

impl ProjectedSeats {
    fn release(&mut self) {
        self.used -= 1;
    }

    /// Over-deployed pools absorb released seats before any becomes free.
    fn take(&mut self) -> bool {
        if self.used >= self.total {
            return false;
        }
        self.used += 1;
        true
    }
}

struct PlanBuilder<'a> {
    policy: &'a OptimizationPolicy,
    actions: Vec<Action>,
    savings: Money,
}

impl<'a> PlanBuilder<'a> {
    fn new(policy: &'a OptimizationPolicy) -> Self {
        Self {
            policy,
            actions: Vec::new(),
            savings: Money::ZERO,
        }
    }

    fn save(&mut self, amount: Money) {
        self.savings = self.savings + amount;
    }

    fn push(&mut self, user: &User, kind: ActionKind) {
        let sequence = self.policy.first_sequence + self.actions.len() as u64;
        self.actions.push(Action::new(
            ActionId::derived(self.policy.run_id, sequence),
            sequence,
            user.id.clone(),
            kind,
        ));
    }

    fn finish(self, users_analyzed: usize) -> OptimizationPlan {
        OptimizationPlan {
            actions: self.actions,
            projected_monthly_savings: self.savings,
            users_analyzed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use seatflow_core::UserId;
    use seatflow_inventory::{Product, ProductCategory};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn pid(s: &str) -> ProductId {
        ProductId::parse(s).unwrap()
    }

    fn pool(code: &str, cents: i64, total: i64, used: i64) -> PoolSnapshot {
        PoolSnapshot {
            product: Product::new(pid(code), code, Money::from_cents(cents), ProductCategory::SingleApp),
            total_seats: total,
            used_seats: used,
        }
    }

    fn active(email: &str, idle_days: i64, products: &[&str]) -> User {
        User::new(UserId::parse(email).unwrap(), "Design", UserStatus::Active)
            .with_products(products.iter().map(|p| pid(p)))
            .with_last_active(now() - Duration::days(idle_days))
    }

    fn waiting(email: &str) -> User {
        User::new(UserId::parse(email).unwrap(), "Design", UserStatus::Waiting)
    }

    fn policy() -> OptimizationPolicy {
        OptimizationPolicy::new(now())
            .with_default_product(pid("p1"))
            .with_run(Uuid::from_u128(42), 1)
    }

    #[test]
    fn reclaims_inactive_user_then_reassigns_waiting_user() {
        let users = vec![
            active("a@x.io", 120, &["p1", "p2"]),
            active("b@x.io", 10, &["p1"]),
            waiting("c@x.io"),
        ];
        let pools = vec![pool("p1", 5000, 3, 2), pool("p2", 2000, 1, 1)];

        let plan = optimize(&users, &pools, &policy()).unwrap();

        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].user_id.as_str(), "a@x.io");
        assert_eq!(
            plan.actions[0].kind,
            ActionKind::Reclaim {
                products: vec![pid("p1"), pid("p2")]
            }
        );
        assert_eq!(plan.actions[1].user_id.as_str(), "c@x.io");
        assert_eq!(
            plan.actions[1].kind,
            ActionKind::Reassign {
                products: vec![pid("p1")]
            }
        );
        assert_eq!(plan.actions[0].sequence, 1);
        assert_eq!(plan.actions[1].sequence, 2);
        assert_eq!(plan.projected_monthly_savings, Money::from_cents(7000));
        assert_eq!(plan.users_analyzed, 3);
    }

    #[test]
    fn downgrade_keeps_first_assigned_product() {
        let users = vec![active("d@x.io", 20, &["p3", "p1", "p2"])];
        let pools = vec![pool("p1", 100, 5, 1), pool("p2", 200, 5, 1), pool("p3", 300, 5, 1)];

        let plan = optimize(&users, &pools, &policy()).unwrap();

        assert_eq!(
            plan.actions[0].kind,
            ActionKind::Downgrade {
                retained: pid("p3"),
                products: vec![pid("p1"), pid("p2")]
            }
        );
        assert_eq!(plan.projected_monthly_savings, Money::from_cents(300));
    }

    #[test]
    fn reclaim_wins_over_downgrade() {
        let users = vec![active("e@x.io", 90, &["p1", "p2", "p3"])];
        let pools = vec![pool("p1", 100, 5, 1), pool("p2", 200, 5, 1), pool("p3", 300, 5, 1)];
        let plan = optimize(&users, &pools, &policy()).unwrap();
        assert_eq!(plan.count_of("reclaim"), 1);
        assert_eq!(plan.count_of("downgrade"), 0);
    }

    #[test]
    fn never_active_user_is_reclaimed() {
        let mut user = active("f@x.io", 0, &["p1"]);
        user.last_active = None;
        let plan = optimize(&[user], &[pool("p1", 100, 1, 1)], &policy()).unwrap();
        assert_eq!(plan.count_of("reclaim"), 1);
    }

    #[test]
    fn reassign_stops_when_pool_is_exhausted() {
        let users = vec![waiting("b@x.io"), waiting("a@x.io"), waiting("c@x.io")];
        let plan = optimize(&users, &[pool("p1", 100, 3, 1)], &policy()).unwrap();
        let granted: Vec<_> = plan.actions.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(granted, vec!["a@x.io", "b@x.io"]);
    }

    #[test]
    fn over_deployed_pool_is_planned_with_no_free_seat() {
        let mut users = vec![
            active("a@x.io", 120, &["p1"]),
            active("b@x.io", 120, &["p1"]),
            active("x@x.io", 5, &["p1"]),
            waiting("c@x.io"),
        ];
        let pools = [pool("p1", 100, 1, 3)];

        let plan = optimize(&users, &pools, &policy()).unwrap();
        assert_eq!(plan.count_of("reclaim"), 2);
        assert_eq!(plan.count_of("reassign"), 0);

        // A third reclaim brings usage under the license and frees one seat.
        users[2] = active("x@x.io", 120, &["p1"]);
        let plan = optimize(&users, &pools, &policy()).unwrap();
        assert_eq!(plan.count_of("reclaim"), 3);
        assert_eq!(plan.count_of("reassign"), 1);
    }

    #[test]
    fn malformed_input_is_rejected_before_planning() {
        let users = vec![active("a@x.io", 120, &["p1"])];
        let err = optimize(&users, &[pool("p1", 100, -1, 0)], &policy()).unwrap_err();
        assert!(matches!(err, ValidationError::Inventory(DomainError::Validation(_))));

        let err = optimize(&users, &[pool("p2", 100, 1, 0)], &policy()).unwrap_err();
        assert!(matches!(err, ValidationError::Inventory(_)));

        let err = optimize(&[], &[pool("p2", 100, 1, 0)], &policy()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownDefaultProduct(pid("p1")));
    }

    #[test]
    fn ties_break_by_user_id() {
        let users = vec![
            active("zed@x.io", 100, &["p1"]),
            active("amy@x.io", 100, &["p1"]),
            active("max@x.io", 100, &["p1"]),
        ];
        let plan = optimize(&users, &[pool("p1", 100, 3, 3)], &policy()).unwrap();
        let order: Vec<_> = plan.actions.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(order, vec!["amy@x.io", "max@x.io", "zed@x.io"]);
    }

    fn arb_user() -> impl Strategy<Value = User> {
        (
            0u32..40,
            prop::option::of(0i64..200),
            prop::sample::subsequence(vec!["p1", "p2", "p3", "p4"], 0..=4),
            any::<bool>(),
        )
            .prop_map(|(n, idle, products, is_waiting)| {
                let email = format!("user{n}@x.io");
                let mut user = if is_waiting && products.is_empty() {
                    waiting(&email)
                } else {
                    active(&email, 0, &products)
                };
                user.last_active = idle.map(|d| now() - Duration::days(d));
                user
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: identical inputs yield identical action lists.
        #[test]
        fn optimize_is_deterministic(users in prop::collection::vec(arb_user(), 0..30)) {
            let mut unique = BTreeMap::new();
            for u in users {
                unique.entry(u.id.clone()).or_insert(u);
            }
            let users: Vec<User> = unique.into_values().rev().collect();
            let pools: Vec<PoolSnapshot> = ["p1", "p2", "p3", "p4"]
                .iter()
                .map(|p| pool(p, 1000, 100, 0))
                .collect();

            let first = optimize(&users, &pools, &policy()).unwrap();
            let second = optimize(&users, &pools, &policy()).unwrap();
            prop_assert_eq!(first, second);

            let mut reversed = users.clone();
            reversed.reverse();
            let third = optimize(&reversed, &pools, &policy()).unwrap();
            prop_assert_eq!(optimize(&users, &pools, &policy()).unwrap(), third);
        }
    }
}
