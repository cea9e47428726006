//! Seat pools.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use seatflow_core::{ProductId, ValueObject};

use crate::product::Product;

/// Live seat pool for one product.
///
/// Seat counters are atomics so that concurrent workers can commit actions in
/// any order and still converge on the same counts. A reservation never pushes
/// `used` past `total` (compare-and-swap). `used` can still exceed `total` when
/// the vendor lowers the licensed capacity; such a pool is over-deployed and
/// has no free seat until enough seats come back.
#[derive(Debug)]
pub struct LicensePool {
    product: Product,
    total: AtomicI64,
    used: AtomicI64,
}

impl LicensePool {
    pub fn new(product: Product, total: i64, used: i64) -> Self {
        Self {
            product,
            total: AtomicI64::new(total),
            used: AtomicI64::new(used),
        }
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> i64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> i64 {
        (self.total() - self.used()).max(0)
    }

    /// Take one seat if one is free. Returns `false` when the pool is full.
    pub fn try_take(&self) -> bool {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            if current >= self.total.load(Ordering::SeqCst) {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give one seat back. Never drops below zero.
    pub fn give_back(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used > 0).then_some(used - 1)
            });
    }

    /// Count a seat granted upstream, even past capacity.
    pub fn restore_seat(&self) {
        self.used.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            product: self.product.clone(),
            total_seats: self.total(),
            used_seats: self.used(),
        }
    }
}

/// Point-in-time view of a pool; the optimizer works on these.
///
/// Seat counts are signed so that malformed external data can be represented
/// and rejected by validation instead of wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub product: Product,
    pub total_seats: i64,
    pub used_seats: i64,
}

impl PoolSnapshot {
    pub fn product_id(&self) -> &ProductId {
        &self.product.id
    }

    pub fn available(&self) -> i64 {
        (self.total_seats - self.used_seats).max(0)
    }
}

impl ValueObject for PoolSnapshot {}
