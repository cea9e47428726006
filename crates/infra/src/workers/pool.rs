use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use seatflow_inventory::InventoryError;

use crate::context::ProvisioningContext;
use crate::jobs::{Claim, NackOutcome, QueueError, QueueJob};
use crate::ledger::CommitOutcome;
use crate::remote::{ApiError, action_request};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub size: usize,
    /// How long one dequeue call blocks before re-checking cancellation.
    pub dequeue_timeout: Duration,
    /// Name prefix for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            dequeue_timeout: Duration::from_secs(1),
            name: "provisioning-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }
}

/// How one claimed job left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Committed,
    /// Committed by an earlier claim; only the ack was missing.
    AlreadyCommitted,
    Requeued,
    /// Put back without spending a retry (open circuit).
    Deferred,
    Abandoned,
    /// Our lease was lost; another claim owns the job now.
    LeaseLost,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_committed: u64,
    pub jobs_requeued: u64,
    pub jobs_deferred: u64,
    pub jobs_abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    committed: AtomicU64,
    requeued: AtomicU64,
    deferred: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Committed | JobOutcome::AlreadyCommitted => &self.committed,
            JobOutcome::Requeued => &self.requeued,
            JobOutcome::Deferred => &self.deferred,
            JobOutcome::Abandoned => &self.abandoned,
            JobOutcome::LeaseLost => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_committed: self.committed.load(Ordering::Relaxed),
            jobs_requeued: self.requeued.load(Ordering::Relaxed),
            jobs_deferred: self.deferred.load(Ordering::Relaxed),
            jobs_abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> WorkerStats {
        self.cancel.cancel();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task panicked");
            }
        }
        self.counters.snapshot()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Fixed-size pool of tasks draining one shared queue.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.size` workers. They run until `cancel` fires (or the
    /// handle shuts them down); a job already claimed is always finished.
    pub fn spawn(
        ctx: ProvisioningContext,
        config: WorkerPoolConfig,
        cancel: CancellationToken,
    ) -> WorkerPoolHandle {
        let counters = Arc::new(Counters::default());
        let cancel = cancel.child_token();
        let joins = (0..config.size.max(1))
            .map(|n| {
                let name = format!("{}-{n}", config.name);
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let counters = counters.clone();
                let timeout = config.dequeue_timeout;
                tokio::spawn(async move { worker_loop(name, ctx, timeout, cancel, counters).await })
            })
            .collect();
        info!(workers = config.size.max(1), "worker pool started");

        WorkerPoolHandle {
            cancel,
            joins,
            counters,
        }
    }
}

async fn worker_loop(
    name: String,
    ctx: ProvisioningContext,
    timeout: Duration,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            claim = ctx.queue.dequeue(&name, timeout) => claim,
        };
        let Some(claim) = claim else {
            continue;
        };
        match process_claim(&ctx, claim, &name).await {
            Ok(outcome) => counters.record(outcome),
            Err(err) => error!(worker = %name, error = %err, "queue rejected job update"),
        }
    }
    debug!(worker = %name, "worker stopped");
}

/// Run one claimed job to its next state: committed, requeued, deferred or
/// abandoned. Errors are queue bookkeeping failures only.
pub async fn process_claim(
    ctx: &ProvisioningContext,
    claim: Claim,
    worker: &str,
) -> Result<JobOutcome, QueueError> {
    let Claim { job, lease } = claim;
    let action = &job.action;
    let job_id = job.job_id;

    if ctx.ledger.is_committed(action.id) {
        return settle(ctx.queue.ack(job_id, lease).await, JobOutcome::AlreadyCommitted);
    }

    let reservation = match ctx.inventory.reserve(action.seats_required()) {
        Ok(reservation) => reservation,
        Err(err @ InventoryError::SeatsExhausted(_)) => {
            // A reclaim still in the queue may free the seat.
            debug!(worker, job_id = %job_id, error = %err, "no seat available yet");
            return requeue(ctx, &job, lease, err.to_string()).await;
        }
        Err(err) => return abandon(ctx, &job, lease, err.to_string()).await,
    };

    let request = action_request(ctx.client.org_id(), action);
    match ctx.client.invoke(&request).await {
        Ok(_) => match ctx.ledger.commit(&ctx.inventory, action, reservation) {
            Ok(CommitOutcome::Applied(_)) => {
                info!(
                    worker,
                    job_id = %job_id,
                    action_id = %action.id,
                    action = action.type_name(),
                    user = %action.user_id,
                    "action committed"
                );
                settle(ctx.queue.ack(job_id, lease).await, JobOutcome::Committed)
            }
            Ok(CommitOutcome::AlreadyApplied) => {
                settle(ctx.queue.ack(job_id, lease).await, JobOutcome::AlreadyCommitted)
            }
            Err(err) => {
                error!(worker, job_id = %job_id, error = %err, "remote applied action but local commit failed");
                abandon(ctx, &job, lease, err.to_string()).await
            }
        },
        Err(err) => {
            ctx.inventory.release(reservation);
            match err {
                // The remote told us when to come back; that costs no retry.
                ApiError::CircuitOpen { retry_in: delay, .. }
                | ApiError::RateLimited {
                    retry_after: Some(delay),
                    ..
                } => {
                    let deferred = ctx.queue.defer(job_id, lease, delay, err.to_string()).await;
                    settle(deferred, JobOutcome::Deferred)
                }
                err if err.is_retryable() => requeue(ctx, &job, lease, err.to_string()).await,
                err => abandon(ctx, &job, lease, err.to_string()).await,
            }
        }
    }
}

async fn requeue(
    ctx: &ProvisioningContext,
    job: &QueueJob,
    lease: crate::jobs::LeaseId,
    reason: String,
) -> Result<JobOutcome, QueueError> {
    match ctx.queue.nack(job.job_id, lease, reason.clone()).await {
        Ok(NackOutcome::Requeued { .. }) => Ok(JobOutcome::Requeued),
        Ok(NackOutcome::Abandoned(job)) => {
            warn!(job_id = %job.job_id, action_id = %job.action.id, error = %reason, "job abandoned after retries");
            ctx.ledger.record_abandoned(&job.action, reason);
            Ok(JobOutcome::Abandoned)
        }
        Err(err) => settle::<()>(Err(err), JobOutcome::Requeued),
    }
}

async fn abandon(
    ctx: &ProvisioningContext,
    job: &QueueJob,
    lease: crate::jobs::LeaseId,
    reason: String,
) -> Result<JobOutcome, QueueError> {
    match ctx.queue.abandon(job.job_id, lease, reason.clone()).await {
        Ok(_) => {
            warn!(job_id = %job.job_id, action_id = %job.action.id, error = %reason, "job abandoned");
            ctx.ledger.record_abandoned(&job.action, reason);
            Ok(JobOutcome::Abandoned)
        }
        Err(err) => settle::<()>(Err(err), JobOutcome::Abandoned),
    }
}

/// A lost lease is not an error for the worker: the job is back in the queue
/// and its next claim resolves it.
fn settle<T>(result: Result<T, QueueError>, outcome: JobOutcome) -> Result<JobOutcome, QueueError> {
    match result {
        Ok(_) => Ok(outcome),
        Err(QueueError::LeaseExpired(job_id)) => {
            debug!(job_id = %job_id, "lease lost before job update");
            Ok(JobOutcome::LeaseLost)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::client::testing::Scripted;
    use crate::remote::{ApiResponse, TransportError};
    use crate::test_support::{Fixture, pid, reclaim, reassign, uid};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn committed_job_updates_inventory_and_ledger() {
        let fx = Fixture::new(vec![]);
        fx.ctx.queue.enqueue(reclaim("a@x.io", &["p1", "p2"], 1), 1).await.unwrap();

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        let outcome = process_claim(&fx.ctx, claim, "w").await.unwrap();

        assert_eq!(outcome, JobOutcome::Committed);
        assert!(fx.ctx.queue.is_empty().await);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 1);
        assert_eq!(fx.ctx.ledger.len(), 1);
        assert!(fx.ctx.inventory.seat_discrepancies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_rejection_abandons_and_releases_seat() {
        let fx = Fixture::new(vec![Scripted::Reply(ApiResponse::new(
            404,
            json!({"message": "user not found"}),
        ))]);
        fx.ctx.queue.enqueue(reassign("c@x.io", "p1", 1), 3).await.unwrap();

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        let outcome = process_claim(&fx.ctx, claim, "w").await.unwrap();

        assert_eq!(outcome, JobOutcome::Abandoned);
        assert!(fx.ctx.queue.is_empty().await);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 2);
        let abandoned = fx.ctx.ledger.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].user_id, uid("c@x.io"));
        assert_eq!(fx.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_requeues_without_losing_seat() {
        let fx = Fixture::new(
            (0..3)
                .map(|_| Scripted::Fail(TransportError::Connection("reset".into())))
                .collect(),
        );
        fx.ctx.queue.enqueue(reassign("c@x.io", "p1", 1), 3).await.unwrap();

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Requeued);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 2);

        let claim = fx.ctx.queue.dequeue("w", Duration::from_secs(10)).await.unwrap();
        assert_eq!(claim.job.retry_count, 1);
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Committed);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 3);
        assert!(fx.ctx.inventory.seat_discrepancies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_without_spending_retry() {
        let fx = Fixture::with_breaker_threshold(
            (0..3).map(|_| Scripted::Reply(ApiResponse::new(500, json!(null)))).collect(),
            3,
        );
        fx.ctx.queue.enqueue(reclaim("a@x.io", &["p1"], 1), 1).await.unwrap();
        fx.ctx.queue.enqueue(reclaim("b@x.io", &["p1"], 2), 1).await.unwrap();

        // First job burns its attempts and opens the breaker.
        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Requeued);

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(claim.job.action.sequence, 2);
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Deferred);
        assert_eq!(fx.transport.call_count(), 3);

        tokio::time::advance(Duration::from_secs(300)).await;
        let mut seen = Vec::new();
        while let Some(claim) = fx.ctx.queue.dequeue("w", Duration::ZERO).await {
            if claim.job.action.sequence == 2 {
                assert_eq!(claim.job.retry_count, 0);
            }
            seen.push(claim.job.action.sequence);
            process_claim(&fx.ctx, claim, "w").await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert!(fx.ctx.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_defers_for_the_server_delay() {
        let fx = Fixture::new(vec![Scripted::Reply(
            ApiResponse::new(429, json!(null)).with_retry_after(Duration::from_secs(600)),
        )]);
        fx.ctx.queue.enqueue(reassign("c@x.io", "p1", 1), 3).await.unwrap();

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Deferred);
        assert_eq!(fx.transport.call_count(), 1);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 2);
        assert!(fx.ctx.ledger.abandoned().is_empty());

        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(fx.ctx.queue.dequeue("w", Duration::ZERO).await.is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(claim.job.retry_count, 0);
        assert_eq!(process_claim(&fx.ctx, claim, "w").await.unwrap(), JobOutcome::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_lease_loss_reports_lease_lost() {
        let fx = Fixture::new(vec![Scripted::Reply(ApiResponse::new(
            404,
            json!({"message": "user not found"}),
        ))]);
        fx.ctx.inventory.set_pool_total(&pid("p2"), 1).unwrap();
        fx.ctx.queue.enqueue(reassign("c@x.io", "p1", 1), 3).await.unwrap();
        fx.ctx.queue.enqueue(reassign("c@x.io", "p2", 2), 3).await.unwrap();

        let first = fx.ctx.queue.dequeue("w1", Duration::ZERO).await.unwrap();
        let second = fx.ctx.queue.dequeue("w1", Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let retaken = (
            fx.ctx.queue.dequeue("w2", Duration::ZERO).await.unwrap(),
            fx.ctx.queue.dequeue("w2", Duration::ZERO).await.unwrap(),
        );

        // Abandon path: remote rejection after the lease moved to w2.
        assert_eq!(first.job.action.sequence, 1);
        assert_eq!(process_claim(&fx.ctx, first, "w1").await.unwrap(), JobOutcome::LeaseLost);
        // Requeue path: no seat left in p2.
        assert_eq!(second.job.action.sequence, 2);
        assert_eq!(process_claim(&fx.ctx, second, "w1").await.unwrap(), JobOutcome::LeaseLost);

        assert!(fx.ctx.ledger.abandoned().is_empty());
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 2);
        assert_eq!(fx.ctx.queue.stats().await.in_flight, 2);
        drop(retaken);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_requeues_grant_until_reclaim_lands() {
        let fx = Fixture::new(vec![]);
        fx.ctx.inventory.set_pool_total(&pid("p2"), 1).unwrap();
        fx.ctx.queue.enqueue(reassign("c@x.io", "p2", 2), 3).await.unwrap();
        fx.ctx.queue.enqueue(reclaim("a@x.io", &["p1", "p2"], 1), 1).await.unwrap();

        // The grant is processed before the reclaim that frees its seat.
        let claims = (
            fx.ctx.queue.dequeue("w1", Duration::ZERO).await.unwrap(),
            fx.ctx.queue.dequeue("w2", Duration::ZERO).await.unwrap(),
        );
        let (reclaim_claim, grant_claim) = claims;
        assert_eq!(process_claim(&fx.ctx, grant_claim, "w2").await.unwrap(), JobOutcome::Requeued);
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(process_claim(&fx.ctx, reclaim_claim, "w1").await.unwrap(), JobOutcome::Committed);

        let claim = fx.ctx.queue.dequeue("w2", Duration::from_secs(10)).await.unwrap();
        assert_eq!(process_claim(&fx.ctx, claim, "w2").await.unwrap(), JobOutcome::Committed);
        assert_eq!(fx.ctx.inventory.pool(&pid("p2")).unwrap().used(), 1);
        assert!(fx.ctx.inventory.seat_discrepancies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn already_committed_job_is_only_acked() {
        let fx = Fixture::new(vec![]);
        let action = reclaim("a@x.io", &["p1", "p2"], 1);
        fx.ctx
            .ledger
            .commit(&fx.ctx.inventory, &action, seatflow_inventory::SeatReservation::empty())
            .unwrap();
        fx.ctx.queue.enqueue(action, 1).await.unwrap();

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        let outcome = process_claim(&fx.ctx, claim, "w").await.unwrap();

        assert_eq!(outcome, JobOutcome::AlreadyCommitted);
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().used(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_drains_queue_and_stops_on_cancel() {
        let fx = Fixture::new(vec![]);
        fx.ctx.queue.enqueue(reclaim("a@x.io", &["p1", "p2"], 1), 1).await.unwrap();
        fx.ctx.queue.enqueue(reclaim("b@x.io", &["p1"], 2), 1).await.unwrap();
        fx.ctx.queue.enqueue(reassign("c@x.io", "p1", 3), 3).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = WorkerPool::spawn(
            fx.ctx.clone(),
            WorkerPoolConfig::default().with_size(2),
            cancel.clone(),
        );
        fx.ctx.queue.wait_drained().await;
        cancel.cancel();
        let stats = handle.shutdown().await;

        assert_eq!(stats.jobs_committed, 3);
        assert_eq!(stats.jobs_abandoned, 0);
        let snapshot = fx.ctx.inventory.snapshot();
        let p1 = snapshot.pool(&pid("p1")).unwrap();
        assert_eq!(p1.used_seats, 1);
        assert!(fx.ctx.inventory.seat_discrepancies().is_empty());
    }
}
