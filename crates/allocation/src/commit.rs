//! Applying a remotely confirmed action to the live inventory.

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use seatflow_core::ProductId;
use seatflow_inventory::{InventoryError, InventoryModel, SeatReservation, UserState, UserStatus};

use crate::action::{Action, ActionKind};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("reservation for {action} covers {reserved:?}, expected {required:?}")]
    ReservationMismatch {
        action: String,
        reserved: Vec<ProductId>,
        required: Vec<ProductId>,
    },
}

/// User state before and after a commit, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub before: UserState,
    pub after: UserState,
}

/// Apply `action` to `inventory`.
///
/// Grants consume `reservation`, which must cover exactly the action's
/// required seats. Removals hand their seats back to the pools. On any error
/// the reservation is released and the inventory is left untouched. A user
/// granted seats without any recorded activity counts as active from now.
pub fn apply(
    inventory: &InventoryModel,
    action: &Action,
    reservation: SeatReservation,
) -> Result<AppliedChange, CommitError> {
    if reservation.products() != action.seats_required() {
        let err = CommitError::ReservationMismatch {
            action: action.id.to_string(),
            reserved: reservation.products().to_vec(),
            required: action.seats_required().to_vec(),
        };
        inventory.release(reservation);
        return Err(err);
    }

    if inventory.user(&action.user_id).is_none() {
        inventory.release(reservation);
        return Err(InventoryError::UnknownUser(action.user_id.clone()).into());
    }

    let mut returned: Vec<ProductId> = Vec::new();
    let change = inventory.update_user(&action.user_id, |user| {
        let before = user.state();
        match &action.kind {
            ActionKind::Reclaim { products } | ActionKind::Downgrade { products, .. } => {
                user.products.retain(|held| {
                    let removed = products.contains(held);
                    if removed {
                        returned.push(held.clone());
                    }
                    !removed
                });
                if matches!(action.kind, ActionKind::Reclaim { .. }) && user.products.is_empty() {
                    user.status = UserStatus::Deprovisioned;
                }
            }
            ActionKind::Reassign { .. } | ActionKind::Provision { .. } => {
                for product in reservation.into_products() {
                    if user.holds(&product) {
                        returned.push(product);
                    } else {
                        user.products.push(product);
                    }
                }
                user.status = UserStatus::Active;
                user.last_active.get_or_insert_with(Utc::now);
            }
        }
        AppliedChange {
            before,
            after: user.state(),
        }
    })?;

    if !returned.is_empty() {
        debug!(action_id = %action.id, seats = returned.len(), "returning seats to pools");
        inventory.return_seats(&returned);
    }
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatflow_core::{ActionId, Money, UserId};
    use seatflow_inventory::{
        InventorySnapshot, PoolSnapshot, Product, ProductCategory, User, UserStatus,
    };

    fn pid(s: &str) -> ProductId {
        ProductId::parse(s).unwrap()
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn inventory() -> InventoryModel {
        let pool = |code: &str, total, used| PoolSnapshot {
            product: Product::new(pid(code), code, Money::from_cents(1000), ProductCategory::Suite),
            total_seats: total,
            used_seats: used,
        };
        InventoryModel::from_snapshot(InventorySnapshot {
            pools: vec![pool("p1", 2, 1), pool("p2", 1, 1)],
            users: vec![
                User::new(uid("a@x.io"), "Ops", UserStatus::Active)
                    .with_products([pid("p1"), pid("p2")]),
                User::new(uid("c@x.io"), "Ops", UserStatus::Waiting),
            ],
        })
        .unwrap()
    }

    fn action(user: &str, kind: ActionKind) -> Action {
        Action::new(ActionId::new(), 1, uid(user), kind)
    }

    #[test]
    fn reclaim_returns_seats_and_deprovisions() {
        let inv = inventory();
        let reclaim = action("a@x.io", ActionKind::Reclaim {
            products: vec![pid("p1"), pid("p2")],
        });

        let change = apply(&inv, &reclaim, SeatReservation::empty()).unwrap();

        assert_eq!(change.before.products.len(), 2);
        assert!(change.after.products.is_empty());
        assert_eq!(change.after.status, UserStatus::Deprovisioned);
        assert_eq!(inv.pool(&pid("p1")).unwrap().used(), 0);
        assert_eq!(inv.pool(&pid("p2")).unwrap().used(), 0);
    }

    #[test]
    fn downgrade_keeps_retained_product() {
        let inv = inventory();
        let downgrade = action("a@x.io", ActionKind::Downgrade {
            retained: pid("p1"),
            products: vec![pid("p2")],
        });

        let change = apply(&inv, &downgrade, SeatReservation::empty()).unwrap();

        assert_eq!(change.after.products, vec![pid("p1")]);
        assert_eq!(change.after.status, UserStatus::Active);
        assert_eq!(inv.pool(&pid("p2")).unwrap().used(), 0);
    }

    #[test]
    fn reassign_consumes_reservation() {
        let inv = inventory();
        let reassign = action("c@x.io", ActionKind::Reassign {
            products: vec![pid("p1")],
        });
        let reservation = inv.reserve(reassign.seats_required()).unwrap();
        assert_eq!(inv.pool(&pid("p1")).unwrap().used(), 2);

        let change = apply(&inv, &reassign, reservation).unwrap();

        assert_eq!(change.before.status, UserStatus::Waiting);
        assert_eq!(change.after.status, UserStatus::Active);
        assert_eq!(inv.user(&uid("c@x.io")).unwrap().products, vec![pid("p1")]);
        assert_eq!(inv.pool(&pid("p1")).unwrap().used(), 2);
    }

    #[test]
    fn mismatched_reservation_is_released() {
        let inv = inventory();
        let reassign = action("c@x.io", ActionKind::Reassign {
            products: vec![pid("p1")],
        });

        let err = apply(&inv, &reassign, SeatReservation::empty()).unwrap_err();

        assert!(matches!(err, CommitError::ReservationMismatch { .. }));
        assert!(inv.user(&uid("c@x.io")).unwrap().products.is_empty());
    }

    #[test]
    fn unknown_user_releases_reservation() {
        let inv = inventory();
        let reassign = action("ghost@x.io", ActionKind::Reassign {
            products: vec![pid("p1")],
        });
        let reservation = inv.reserve(reassign.seats_required()).unwrap();

        let err = apply(&inv, &reassign, reservation).unwrap_err();

        assert!(matches!(err, CommitError::Inventory(InventoryError::UnknownUser(_))));
        assert_eq!(inv.pool(&pid("p1")).unwrap().used(), 1);
    }

    #[test]
    fn granting_a_held_product_gives_the_seat_back() {
        let inv = inventory();
        let provision = action("a@x.io", ActionKind::Provision {
            request_number: "REQ-1".into(),
            products: vec![pid("p1")],
        });
        let reservation = inv.reserve(provision.seats_required()).unwrap();

        apply(&inv, &provision, reservation).unwrap();

        assert_eq!(inv.user(&uid("a@x.io")).unwrap().products.len(), 2);
        assert_eq!(inv.pool(&pid("p1")).unwrap().used(), 1);
    }

    mod convergence {
        use super::*;
        use crate::optimizer::optimize;
        use crate::policy::OptimizationPolicy;
        use chrono::{Duration, TimeZone, Utc};
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        const CODES: [&str; 3] = ["p1", "p2", "p3"];

        fn arb_inventory() -> impl Strategy<Value = InventorySnapshot> {
            let user = (
                prop::option::of(0i64..150),
                prop::sample::subsequence(CODES.to_vec(), 0..=3),
            );
            (prop::collection::vec(user, 1..25), 0i64..4).prop_map(|(users, spare)| {
                let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
                let mut used: BTreeMap<&str, i64> = CODES.iter().map(|c| (*c, 0)).collect();
                let users = users
                    .into_iter()
                    .enumerate()
                    .map(|(i, (idle, products))| {
                        let id = uid(&format!("u{i:03}@x.io"));
                        if products.is_empty() {
                            return User::new(id, "Ops", UserStatus::Waiting);
                        }
                        for p in &products {
                            *used.get_mut(p).unwrap() += 1;
                        }
                        let mut user = User::new(id, "Ops", UserStatus::Active)
                            .with_products(products.iter().map(|p| pid(p)));
                        user.last_active = idle.map(|d| now - Duration::days(d));
                        user
                    })
                    .collect();
                let pools = used
                    .into_iter()
                    .map(|(code, used)| PoolSnapshot {
                        product: Product::new(pid(code), code, Money::from_cents(500), ProductCategory::Suite),
                        total_seats: used + spare,
                        used_seats: used,
                    })
                    .collect();
                InventorySnapshot { pools, users }
            })
        }

        fn pool_counts(inv: &InventoryModel) -> Vec<(ProductId, i64, i64)> {
            inv.snapshot()
                .pools
                .into_iter()
                .map(|p| (p.product.id.clone(), p.total_seats, p.used_seats))
                .collect()
        }

        /// Apply every action, retrying ones that found their pool empty in a
        /// later pass (the way a nacked job comes back).
        fn apply_all(inv: &InventoryModel, actions: &[Action]) {
            let mut pending: Vec<&Action> = actions.iter().collect();
            for _ in 0..=actions.len() {
                let mut deferred = Vec::new();
                for action in pending {
                    match inv.reserve(action.seats_required()) {
                        Ok(reservation) => {
                            apply(inv, action, reservation).unwrap();
                        }
                        Err(InventoryError::SeatsExhausted(_)) => deferred.push(action),
                        Err(other) => panic!("unexpected reserve failure: {other}"),
                    }
                }
                if deferred.is_empty() {
                    return;
                }
                pending = deferred;
            }
            panic!("actions never converged");
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            /// Property: committing the plan in any order ends in the same
            /// pool counts, with pool counters matching the holders.
            #[test]
            fn plan_commits_commute(
                (snapshot, order) in arb_inventory().prop_flat_map(|snapshot| {
                    let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
                    let policy = OptimizationPolicy::new(now).with_default_product(pid("p1"));
                    let len = optimize(&snapshot.users, &snapshot.pools, &policy)
                        .map(|plan| plan.actions.len())
                        .unwrap_or(0);
                    (Just(snapshot), Just((0..len).collect::<Vec<_>>()).prop_shuffle())
                })
            ) {
                let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
                let policy = OptimizationPolicy::new(now)
                    .with_default_product(pid("p1"))
                    .with_run(uuid::Uuid::nil(), 1);
                let plan = optimize(&snapshot.users, &snapshot.pools, &policy).unwrap();
                prop_assert_eq!(plan.actions.len(), order.len());

                let sequential = InventoryModel::from_snapshot(snapshot.clone()).unwrap();
                apply_all(&sequential, &plan.actions);

                let shuffled_actions: Vec<Action> =
                    order.iter().map(|i| plan.actions[*i].clone()).collect();
                let shuffled = InventoryModel::from_snapshot(snapshot).unwrap();
                apply_all(&shuffled, &shuffled_actions);

                prop_assert_eq!(pool_counts(&sequential), pool_counts(&shuffled));
                prop_assert!(shuffled.seat_discrepancies().is_empty());
                prop_assert!(sequential.seat_discrepancies().is_empty());
            }
        }
    }
}
