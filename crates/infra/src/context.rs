use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use seatflow_inventory::InventoryModel;

use crate::jobs::ProvisioningQueue;
use crate::ledger::SyncLedger;
use crate::remote::ProvisioningClient;

/// Everything the workers, the sync coordinator and the orchestrator share.
#[derive(Debug, Clone)]
pub struct ProvisioningContext {
    pub inventory: Arc<InventoryModel>,
    pub queue: Arc<ProvisioningQueue>,
    pub client: Arc<ProvisioningClient>,
    pub ledger: Arc<SyncLedger>,
    sequence: Arc<AtomicU64>,
}

impl ProvisioningContext {
    pub fn new(
        inventory: Arc<InventoryModel>,
        queue: Arc<ProvisioningQueue>,
        client: Arc<ProvisioningClient>,
        ledger: Arc<SyncLedger>,
    ) -> Self {
        let next = ledger.max_sequence() + 1;
        Self {
            inventory,
            queue,
            client,
            ledger,
            sequence: Arc::new(AtomicU64::new(next)),
        }
    }

    /// Next unused action sequence number.
    pub fn peek_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Reserve `count` consecutive sequence numbers, returning the first.
    pub fn take_sequences(&self, count: u64) -> u64 {
        self.sequence.fetch_add(count, Ordering::SeqCst)
    }
}
