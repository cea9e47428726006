//! The provisioning queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use seatflow_allocation::Action;
use seatflow_core::DomainError;

use super::store::{QueueStore, StoreError};
use super::types::{JobId, LeaseId, QueueJob};
use crate::remote::RetryPolicy;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid action: {0}")]
    InvalidAction(#[from] DomainError),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// The lease was lost (expired or superseded by a newer claim).
    #[error("lease on job {0} expired")]
    LeaseExpired(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub lease_timeout: Duration,
    /// Retry budget given to newly enqueued jobs.
    pub max_retries: u32,
    /// Requeue delay after the n-th nack.
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            max_retries: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// A claimed job and the lease proving the claim.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: QueueJob,
    pub lease: LeaseId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { retry_count: u32, delay: Duration },
    /// Retry budget exhausted; the job left the queue.
    Abandoned(QueueJob),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub delayed: usize,
}

#[derive(Debug)]
struct Lease {
    id: LeaseId,
    worker: String,
    deadline: Instant,
}

#[derive(Debug)]
struct Entry {
    job: QueueJob,
    not_before: Option<Instant>,
    lease: Option<Lease>,
}

impl Entry {
    fn ready(&self, now: Instant) -> bool {
        self.lease.is_none() && self.not_before.is_none_or(|t| t <= now)
    }
}

/// Order key: priority, then arrival.
type Slot = (u8, u64);

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<Slot, Entry>,
    index: HashMap<JobId, Slot>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, job: QueueJob) {
        let slot = (job.priority, self.next_seq);
        self.next_seq += 1;
        self.index.insert(job.job_id, slot);
        self.entries.insert(
            slot,
            Entry {
                job,
                not_before: None,
                lease: None,
            },
        );
    }

    fn remove(&mut self, job_id: JobId) -> Option<QueueJob> {
        let slot = self.index.remove(&job_id)?;
        self.entries.remove(&slot).map(|e| e.job)
    }

    /// Clear leases whose deadline passed. The job keeps its slot and retry
    /// count.
    fn reap_expired(&mut self, now: Instant) -> usize {
        let mut reaped = 0;
        for entry in self.entries.values_mut() {
            if entry.lease.as_ref().is_some_and(|l| l.deadline <= now) {
                if let Some(lease) = entry.lease.take() {
                    warn!(
                        job_id = %entry.job.job_id,
                        worker = %lease.worker,
                        "lease expired, job returned to queue"
                    );
                }
                reaped += 1;
            }
        }
        reaped
    }

    /// Entry held under `lease`, or the reason it is not.
    fn leased_mut(&mut self, job_id: JobId, lease: LeaseId) -> Result<&mut Entry, QueueError> {
        let slot = self.index.get(&job_id).ok_or(QueueError::UnknownJob(job_id))?;
        let entry = self
            .entries
            .get_mut(slot)
            .ok_or(QueueError::UnknownJob(job_id))?;
        match &entry.lease {
            Some(held) if held.id == lease => Ok(entry),
            _ => Err(QueueError::LeaseExpired(job_id)),
        }
    }

    /// Earliest instant at which something may become claimable.
    fn next_wake(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| match &e.lease {
                Some(lease) => Some(lease.deadline),
                None => e.not_before,
            })
            .min()
    }

    fn jobs(&self) -> Vec<QueueJob> {
        self.entries.values().map(|e| e.job.clone()).collect()
    }
}

/// Async priority queue shared by the orchestrator, sync coordinator and
/// workers.
pub struct ProvisioningQueue {
    settings: QueueSettings,
    state: Mutex<State>,
    store: Arc<dyn QueueStore>,
    available: Notify,
    drained: Notify,
}

impl std::fmt::Debug for ProvisioningQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProvisioningQueue {
    /// Open the queue over `store`, restoring persisted jobs. Jobs that were
    /// claimed when the process stopped come back unclaimed.
    pub fn open(store: Arc<dyn QueueStore>, settings: QueueSettings) -> Result<Self, QueueError> {
        let mut state = State::default();
        let mut restored = store.load()?;
        // Persisted order is dequeue order; a stable sort keeps FIFO per priority.
        restored.sort_by_key(|j| j.priority);
        let count = restored.len();
        for job in restored {
            state.insert(job);
        }
        if count > 0 {
            info!(jobs = count, "restored provisioning queue");
        }
        Ok(Self {
            settings,
            state: Mutex::new(state),
            store,
            available: Notify::new(),
            drained: Notify::new(),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Validate and enqueue an action. Nothing enters the queue (or its
    /// store) unless the action is well-formed and the write succeeded.
    pub async fn enqueue(&self, action: Action, priority: u8) -> Result<JobId, QueueError> {
        action.validate()?;
        let job = QueueJob::new(action, priority, self.settings.max_retries);
        let job_id = job.job_id;
        let action_id = job.action.id;

        let mut state = self.state.lock().await;
        state.insert(job);
        if let Err(err) = self.store.save(&state.jobs()) {
            state.remove(job_id);
            return Err(err.into());
        }
        drop(state);

        debug!(job_id = %job_id, action_id = %action_id, priority, "job enqueued");
        self.available.notify_waiters();
        Ok(job_id)
    }

    /// Claim the highest-priority ready job, waiting up to `timeout` for one.
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> Option<Claim> {
        let give_up = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.reap_expired(now);

            let slot = state
                .entries
                .iter()
                .find(|(_, e)| e.ready(now))
                .map(|(slot, _)| *slot);
            if let Some(slot) = slot {
                let lease = LeaseId::new();
                let Some(entry) = state.entries.get_mut(&slot) else {
                    continue;
                };
                entry.not_before = None;
                entry.lease = Some(Lease {
                    id: lease,
                    worker: worker_id.to_string(),
                    deadline: now + self.settings.lease_timeout,
                });
                let job = entry.job.clone();
                debug!(job_id = %job.job_id, worker = worker_id, lease = %lease, "job claimed");
                return Some(Claim { job, lease });
            }

            if now >= give_up {
                return None;
            }
            let wake = state.next_wake().map_or(give_up, |t| t.min(give_up));
            drop(state);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Complete a claimed job.
    pub async fn ack(&self, job_id: JobId, lease: LeaseId) -> Result<QueueJob, QueueError> {
        let mut state = self.lock_reaped().await;
        state.leased_mut(job_id, lease)?;
        let job = state.remove(job_id).ok_or(QueueError::UnknownJob(job_id))?;
        self.persist(&state);
        self.notify_if_drained(&state);
        debug!(job_id = %job_id, "job acknowledged");
        Ok(job)
    }

    /// Report a failed attempt. Requeues with backoff while retries remain,
    /// otherwise removes the job and hands it back as abandoned.
    pub async fn nack(
        &self,
        job_id: JobId,
        lease: LeaseId,
        error: impl Into<String>,
    ) -> Result<NackOutcome, QueueError> {
        let error = error.into();
        let mut state = self.lock_reaped().await;
        let entry = state.leased_mut(job_id, lease)?;

        if !entry.job.can_retry() {
            entry.job.last_error = Some(error);
            let job = state.remove(job_id).ok_or(QueueError::UnknownJob(job_id))?;
            self.persist(&state);
            self.notify_if_drained(&state);
            warn!(job_id = %job_id, retries = job.retry_count, "retry budget exhausted");
            return Ok(NackOutcome::Abandoned(job));
        }

        entry.job.retry_count += 1;
        entry.job.last_error = Some(error);
        let retry_count = entry.job.retry_count;
        let delay = self.settings.retry.delay_for_attempt(retry_count);
        entry.lease = None;
        entry.not_before = Some(Instant::now() + delay);
        self.persist(&state);
        drop(state);

        debug!(job_id = %job_id, retry_count, delay_ms = delay.as_millis() as u64, "job requeued");
        self.available.notify_waiters();
        Ok(NackOutcome::Requeued { retry_count, delay })
    }

    /// Put a claimed job back after `delay` without spending a retry.
    pub async fn defer(
        &self,
        job_id: JobId,
        lease: LeaseId,
        delay: Duration,
        reason: impl Into<String>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock_reaped().await;
        let entry = state.leased_mut(job_id, lease)?;
        entry.job.last_error = Some(reason.into());
        entry.lease = None;
        entry.not_before = Some(Instant::now() + delay);
        self.persist(&state);
        drop(state);

        debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "job deferred");
        self.available.notify_waiters();
        Ok(())
    }

    /// Remove a claimed job that must not be retried.
    pub async fn abandon(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: impl Into<String>,
    ) -> Result<QueueJob, QueueError> {
        let mut state = self.lock_reaped().await;
        state.leased_mut(job_id, lease)?.job.last_error = Some(reason.into());
        let job = state.remove(job_id).ok_or(QueueError::UnknownJob(job_id))?;
        self.persist(&state);
        self.notify_if_drained(&state);
        Ok(job)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.lock_reaped().await;
        let now = Instant::now();
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            if entry.lease.is_some() {
                stats.in_flight += 1;
            } else if entry.ready(now) {
                stats.queued += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolve once no job is queued, delayed or in flight.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }

    async fn lock_reaped(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        if state.reap_expired(Instant::now()) > 0 {
            self.available.notify_waiters();
        }
        state
    }

    fn persist(&self, state: &State) {
        if let Err(err) = self.store.save(&state.jobs()) {
            // The in-memory queue stays authoritative; the next successful
            // save catches the store up.
            error!(error = %err, "failed to persist provisioning queue");
        }
    }

    fn notify_if_drained(&self, state: &State) {
        if state.entries.is_empty() {
            self.drained.notify_waiters();
        }
    }
}
