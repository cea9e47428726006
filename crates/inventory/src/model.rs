//! The live inventory shared by workers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use seatflow_core::{DomainError, ProductId, UserId};

use crate::pool::{LicensePool, PoolSnapshot};
use crate::product::Product;
use crate::user::{User, UserState, UserStatus};

/// Inventory error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),
    #[error("no seat available for product {0}")]
    SeatsExhausted(ProductId),
    #[error(transparent)]
    Invalid(#[from] DomainError),
}

/// Serializable view of the whole inventory (pools + users).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySnapshot {
    pub pools: Vec<PoolSnapshot>,
    pub users: Vec<User>,
}

impl InventorySnapshot {
    /// Structural validation shared by the model and the optimizer.
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_parts(&self.users, &self.pools)
    }

    pub fn pool(&self, product: &ProductId) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|p| p.product_id() == product)
    }
}

/// Validate pools and users: non-negative seat counts and costs, unique
/// products and users, and every assignment referencing a known product.
///
/// A pool using more seats than it licenses is over-deployed, not malformed:
/// compliance reports it and grants simply find no free seat.
pub fn validate_parts(users: &[User], pools: &[PoolSnapshot]) -> Result<(), DomainError> {
    let mut known = HashSet::new();
    for pool in pools {
        let id = pool.product_id();
        if pool.total_seats < 0 || pool.used_seats < 0 {
            return Err(DomainError::validation(format!(
                "negative seat count for product {id} (total {}, used {})",
                pool.total_seats, pool.used_seats
            )));
        }
        if pool.product.cost_per_seat.cents() < 0 {
            return Err(DomainError::validation(format!("negative seat cost for product {id}")));
        }
        if !known.insert(id.clone()) {
            return Err(DomainError::validation(format!("duplicate pool for product {id}")));
        }
    }

    let mut seen = HashSet::new();
    for user in users {
        if !seen.insert(&user.id) {
            return Err(DomainError::validation(format!("duplicate user {}", user.id)));
        }
        let mut held = HashSet::new();
        for product in &user.products {
            if !known.contains(product) {
                return Err(DomainError::validation(format!(
                    "user {} references unknown product {product}",
                    user.id
                )));
            }
            if !held.insert(product) {
                return Err(DomainError::validation(format!(
                    "user {} holds product {product} twice",
                    user.id
                )));
            }
        }
    }
    Ok(())
}

/// Seats taken from pools ahead of a grant.
///
/// A reservation must either be consumed by a commit or handed back with
/// [`InventoryModel::release`].
#[derive(Debug, Default, PartialEq, Eq)]
#[must_use = "a reservation holds seats until committed or released"]
pub struct SeatReservation {
    products: Vec<ProductId>,
}

impl SeatReservation {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn products(&self) -> &[ProductId] {
        &self.products
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Consume the reservation; the seats now belong to the holder.
    pub fn into_products(self) -> Vec<ProductId> {
        self.products
    }
}

/// In-memory inventory model.
///
/// Pool counters are atomics (commutative increments). User records sit behind
/// a lock but each user is only written by the worker that owns the job for
/// that user.
#[derive(Debug)]
pub struct InventoryModel {
    pools: HashMap<ProductId, LicensePool>,
    users: RwLock<BTreeMap<UserId, User>>,
}

impl InventoryModel {
    pub fn from_snapshot(snapshot: InventorySnapshot) -> Result<Self, InventoryError> {
        snapshot.validate()?;
        let pools = snapshot
            .pools
            .into_iter()
            .map(|p| {
                let id = p.product.id.clone();
                (id, LicensePool::new(p.product, p.total_seats, p.used_seats))
            })
            .collect();
        let users = snapshot
            .users
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();
        Ok(Self {
            pools,
            users: RwLock::new(users),
        })
    }

    /// Consistent-enough copy for a planning run: pools sorted by product,
    /// users sorted by id.
    pub fn snapshot(&self) -> InventorySnapshot {
        let mut pools: Vec<_> = self.pools.values().map(LicensePool::snapshot).collect();
        pools.sort_by(|a, b| a.product.id.cmp(&b.product.id));
        let users = self.read_users().values().cloned().collect();
        InventorySnapshot { pools, users }
    }

    pub fn product(&self, id: &ProductId) -> Option<&Product> {
        self.pools.get(id).map(LicensePool::product)
    }

    pub fn pool(&self, id: &ProductId) -> Option<&LicensePool> {
        self.pools.get(id)
    }

    pub fn user(&self, id: &UserId) -> Option<User> {
        self.read_users().get(id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.read_users().len()
    }

    /// Take one seat per product, all or nothing.
    pub fn reserve(&self, products: &[ProductId]) -> Result<SeatReservation, InventoryError> {
        let mut taken: Vec<ProductId> = Vec::with_capacity(products.len());
        for product in products {
            let outcome = match self.pools.get(product) {
                None => Err(InventoryError::UnknownProduct(product.clone())),
                Some(pool) if pool.try_take() => Ok(()),
                Some(_) => Err(InventoryError::SeatsExhausted(product.clone())),
            };
            if let Err(err) = outcome {
                self.return_seats(&taken);
                return Err(err);
            }
            taken.push(product.clone());
        }
        Ok(SeatReservation { products: taken })
    }

    /// Hand unused reserved seats back to their pools.
    pub fn release(&self, reservation: SeatReservation) {
        self.return_seats(&reservation.into_products());
    }

    /// Return seats of committed reclaims/downgrades to their pools.
    pub fn return_seats(&self, products: &[ProductId]) {
        for product in products {
            match self.pools.get(product) {
                Some(pool) => pool.give_back(),
                None => debug!(product = %product, "seat returned for unknown product ignored"),
            }
        }
    }

    /// Set the licensed capacity. A total below current usage leaves the pool
    /// over-deployed.
    pub fn set_pool_total(&self, product: &ProductId, total: i64) -> Result<(), InventoryError> {
        let pool = self
            .pools
            .get(product)
            .ok_or_else(|| InventoryError::UnknownProduct(product.clone()))?;
        if total < 0 {
            return Err(DomainError::validation(format!("negative seat total for {product}")).into());
        }
        pool.set_total(total);
        Ok(())
    }

    /// Register a user first seen in an external request. Returns `true` when
    /// the user was created.
    pub fn ensure_user(&self, id: &UserId, department: &str) -> bool {
        let mut users = self.write_users();
        if users.contains_key(id) {
            return false;
        }
        users.insert(
            id.clone(),
            User::new(id.clone(), department, UserStatus::Waiting),
        );
        true
    }

    /// Bring a user to a previously committed state, moving pool counts by the
    /// difference with what the model holds. Unknown users are created and
    /// products without a pool are dropped. Returns `true` when anything
    /// changed.
    pub fn restore_user(&self, id: &UserId, state: &UserState, committed_at: DateTime<Utc>) -> bool {
        let target: Vec<ProductId> = state
            .products
            .iter()
            .filter(|p| {
                let known = self.pools.contains_key(*p);
                if !known {
                    warn!(user = %id, product = %p, "dropping restored product without a pool");
                }
                known
            })
            .cloned()
            .collect();

        let mut users = self.write_users();
        let user = users
            .entry(id.clone())
            .or_insert_with(|| User::new(id.clone(), "", UserStatus::Waiting));
        if user.status == state.status && user.products == target {
            return false;
        }

        let removed: Vec<ProductId> = user
            .products
            .iter()
            .filter(|p| !target.contains(p))
            .cloned()
            .collect();
        let added: Vec<&ProductId> = target.iter().filter(|p| !user.holds(p)).collect();
        self.return_seats(&removed);
        for product in &added {
            if let Some(pool) = self.pools.get(*product) {
                pool.restore_seat();
            }
        }
        if !added.is_empty() {
            user.last_active.get_or_insert(committed_at);
        }
        user.products = target.clone();
        user.status = state.status;
        true
    }

    /// Mutate one user record.
    pub fn update_user<R>(
        &self,
        id: &UserId,
        f: impl FnOnce(&mut User) -> R,
    ) -> Result<R, InventoryError> {
        let mut users = self.write_users();
        let user = users
            .get_mut(id)
            .ok_or_else(|| InventoryError::UnknownUser(id.clone()))?;
        Ok(f(user))
    }

    fn read_users(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<UserId, User>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_users(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<UserId, User>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }
}
