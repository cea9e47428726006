//! Worker pool draining the provisioning queue.

pub mod pool;

pub use pool::{JobOutcome, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats, process_claim};
