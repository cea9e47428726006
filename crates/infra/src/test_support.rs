//! Shared fixtures for the crate's async tests.

use std::sync::Arc;
use std::time::Duration;

use seatflow_allocation::{Action, ActionKind};
use seatflow_core::{ActionId, Money, ProductId, UserId};
use seatflow_inventory::{
    InventoryModel, InventorySnapshot, PoolSnapshot, Product, ProductCategory, User, UserStatus,
};

use crate::context::ProvisioningContext;
use crate::jobs::{InMemoryQueueStore, ProvisioningQueue, QueueSettings};
use crate::ledger::SyncLedger;
use crate::remote::client::testing::{Scripted, ScriptedTransport};
use crate::remote::{BreakerSettings, CircuitBreakerRegistry, ProvisioningClient, RetryPolicy};

pub fn pid(s: &str) -> ProductId {
    ProductId::parse(s).unwrap()
}

pub fn uid(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

pub fn reclaim(user: &str, products: &[&str], sequence: u64) -> Action {
    Action::new(
        ActionId::new(),
        sequence,
        uid(user),
        ActionKind::Reclaim {
            products: products.iter().map(|p| pid(p)).collect(),
        },
    )
}

pub fn reassign(user: &str, product: &str, sequence: u64) -> Action {
    Action::new(
        ActionId::new(),
        sequence,
        uid(user),
        ActionKind::Reassign {
            products: vec![pid(product)],
        },
    )
}

/// Pools: p1 (3 seats, 2 used), p2 (2 seats, 1 used).
/// Users: a@x.io active [p1, p2], b@x.io active [p1], c@x.io waiting.
pub fn snapshot() -> InventorySnapshot {
    let pool = |code: &str, cents, total, used| PoolSnapshot {
        product: Product::new(pid(code), code.to_uppercase(), Money::from_cents(cents), ProductCategory::SingleApp),
        total_seats: total,
        used_seats: used,
    };
    InventorySnapshot {
        pools: vec![pool("p1", 5_000, 3, 2), pool("p2", 2_000, 2, 1)],
        users: vec![
            User::new(uid("a@x.io"), "Design", UserStatus::Active).with_products([pid("p1"), pid("p2")]),
            User::new(uid("b@x.io"), "Design", UserStatus::Active).with_products([pid("p1")]),
            User::new(uid("c@x.io"), "Sales", UserStatus::Waiting),
        ],
    }
}

pub struct Fixture {
    pub ctx: ProvisioningContext,
    pub transport: Arc<ScriptedTransport>,
}

impl Fixture {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self::with_breaker_threshold(script, 6)
    }

    pub fn with_breaker_threshold(script: Vec<Scripted>, threshold: u32) -> Self {
        Self::with_transport(ScriptedTransport::new(script), threshold)
    }

    pub fn with_transport(transport: ScriptedTransport, threshold: u32) -> Self {
        let transport = Arc::new(transport);
        let client = ProvisioningClient::new(
            transport.clone(),
            CircuitBreakerRegistry::arc(BreakerSettings {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(300),
            }),
            RetryPolicy::exponential(3, Duration::from_millis(500), 2.0, Duration::from_secs(30)),
        )
        .with_org_id("org");
        let queue = ProvisioningQueue::open(
            InMemoryQueueStore::arc(),
            QueueSettings {
                lease_timeout: Duration::from_secs(300),
                max_retries: 3,
                retry: RetryPolicy::exponential(3, Duration::from_secs(1), 2.0, Duration::from_secs(30)),
            },
        )
        .unwrap();
        let ctx = ProvisioningContext::new(
            Arc::new(InventoryModel::from_snapshot(snapshot()).unwrap()),
            Arc::new(queue),
            Arc::new(client),
            Arc::new(SyncLedger::in_memory()),
        );
        Self { ctx, transport }
    }
}
