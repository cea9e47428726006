//! Provisioning queue: durable, prioritized, leased.
//!
//! ## Design
//!
//! - Strict priority (lower value first), FIFO within a priority
//! - A claimed job is invisible to other workers until ack / nack / defer /
//!   abandon or lease expiry
//! - Expired leases put the job back at its original position with its retry
//!   count unchanged
//! - Every mutation is written through to a `QueueStore`
//!
//! ## Components
//!
//! - `QueueJob`: an `Action` plus queue bookkeeping (the durable wire format)
//! - `QueueStore`: persistence (in-memory or JSON file)
//! - `ProvisioningQueue`: the async queue workers drain

pub mod queue;
pub mod store;
pub mod types;

pub use queue::{Claim, NackOutcome, ProvisioningQueue, QueueError, QueueSettings, QueueStats};
pub use store::{InMemoryQueueStore, JsonFileQueueStore, QueueStore, StoreError};
pub use types::{JobId, LeaseId, QueueJob};
