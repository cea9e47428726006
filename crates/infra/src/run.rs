//! One optimization run end to end, and the periodic loop around it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use seatflow_allocation::{Action, ActionKind, OptimizationPolicy, SyncOutcome, ValidationError, optimize};
use seatflow_core::{ActionId, Money};
use seatflow_inventory::{
    ActivityThresholds, InventoryError, InventoryModel, InventorySnapshot, activity_report,
};

use crate::config::{Config, ConfigError};
use crate::context::ProvisioningContext;
use crate::jobs::{
    InMemoryQueueStore, JsonFileQueueStore, ProvisioningQueue, QueueError, QueueSettings,
    QueueStore,
};
use crate::ledger::{LedgerError, SyncLedger};
use crate::remote::{CircuitBreakerRegistry, ProvisioningClient, Transport};
use crate::sync::SyncCoordinator;
use crate::workers::{WorkerPool, WorkerPoolConfig, WorkerStats};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid optimizer input: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid inventory snapshot: {0}")]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Structured result of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub users_analyzed: usize,
    pub actions_proposed: usize,
    pub actions_committed: usize,
    /// Proposed but neither committed nor abandoned when the run stopped.
    pub actions_failed: usize,
    pub actions_abandoned: usize,
    pub projected_savings: Money,
}

/// Queue priority of an optimizer action: reclaims free seats first.
pub fn action_priority(action: &Action) -> u8 {
    match action.kind {
        ActionKind::Reclaim { .. } => 1,
        ActionKind::Downgrade { .. } | ActionKind::Provision { .. } => 2,
        ActionKind::Reassign { .. } => 3,
    }
}

/// Drives the optimize, enqueue and drain phases, never overlapping with a
/// reconciliation pass.
#[derive(Debug)]
pub struct Orchestrator {
    ctx: ProvisioningContext,
    sync: SyncCoordinator,
    policy: OptimizationPolicy,
    activity: ActivityThresholds,
    workers: WorkerPoolConfig,
}

impl Orchestrator {
    pub fn new(
        ctx: ProvisioningContext,
        sync: SyncCoordinator,
        policy: OptimizationPolicy,
        activity: ActivityThresholds,
        workers: WorkerPoolConfig,
    ) -> Self {
        Self {
            ctx,
            sync,
            policy,
            activity,
            workers,
        }
    }

    /// Wire every component from configuration. The queue and ledger are
    /// file-backed when their paths are set.
    pub fn from_config(
        config: &Config,
        inventory: InventorySnapshot,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let activity = config.activity_thresholds()?;
        let inventory = InventoryModel::from_snapshot(inventory)?;

        let store: Arc<dyn QueueStore> = match &config.queue.store_path {
            Some(path) => Arc::new(JsonFileQueueStore::new(path)),
            None => InMemoryQueueStore::arc(),
        };
        let queue = ProvisioningQueue::open(
            store,
            QueueSettings {
                lease_timeout: config.lease_timeout(),
                max_retries: config.queue.max_retries,
                retry: config.retry_policy(),
            },
        )?;
        let ledger = match &config.ledger_path {
            Some(path) => SyncLedger::open(path)?,
            None => SyncLedger::in_memory(),
        };
        ledger.replay_into(&inventory);
        let client = ProvisioningClient::new(
            transport,
            CircuitBreakerRegistry::arc(config.breaker_settings()),
            config.retry_policy(),
        )
        .with_request_timeout(config.request_timeout())
        .with_max_retry_after(config.max_retry_after())
        .with_org_id(config.remote.org_id.clone());

        let ctx = ProvisioningContext::new(
            Arc::new(inventory),
            Arc::new(queue),
            Arc::new(client),
            Arc::new(ledger),
        );
        let sync = SyncCoordinator::new(ctx.clone(), config.sync.approval_priority, config.retry_policy());
        let workers = WorkerPoolConfig::default()
            .with_size(config.workers.pool_size)
            .with_dequeue_timeout(config.dequeue_timeout());

        Ok(Self::new(
            ctx,
            sync,
            config.optimization_policy(Utc::now()),
            activity,
            workers,
        ))
    }

    pub fn context(&self) -> &ProvisioningContext {
        &self.ctx
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// Optimize against a fresh snapshot, enqueue the plan and drain the
    /// queue. Cancellation stops claiming new jobs; claimed jobs finish.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary, RunError> {
        let pool = WorkerPool::spawn(self.ctx.clone(), self.workers.clone(), cancel.clone());

        // Leftovers from a previous run (or a restart) settle before the
        // snapshot, so the optimizer never races in-flight commits.
        if !self.ctx.queue.is_empty().await && !self.drain(cancel).await {
            let stats = pool.shutdown().await;
            info!(committed = stats.jobs_committed, "run cancelled while draining backlog");
            return Ok(RunSummary::default());
        }

        let reference_time = Utc::now();
        let snapshot = self.ctx.inventory.snapshot();
        let report = activity_report(&snapshot.users, &snapshot.pools, reference_time, &self.activity);
        info!(
            users = report.total_users,
            inactive = report.inactive_users(),
            "activity analysed"
        );

        let run_id = Uuid::now_v7();
        let policy = OptimizationPolicy {
            reference_time,
            ..self.policy.clone()
        }
        .with_run(run_id, self.ctx.peek_sequence());
        let plan = match optimize(&snapshot.users, &snapshot.pools, &policy) {
            Ok(plan) => plan,
            Err(err) => {
                pool.shutdown().await;
                return Err(err.into());
            }
        };
        self.ctx.take_sequences(plan.actions.len() as u64);
        info!(
            run_id = %run_id,
            users = plan.users_analyzed,
            actions = plan.actions.len(),
            reclaims = plan.count_of("reclaim"),
            downgrades = plan.count_of("downgrade"),
            reassigns = plan.count_of("reassign"),
            savings_cents = plan.projected_monthly_savings.cents(),
            "optimization plan ready"
        );

        let mut ids = HashSet::with_capacity(plan.actions.len());
        for action in &plan.actions {
            ids.insert(action.id);
            match self.ctx.queue.enqueue(action.clone(), action_priority(action)).await {
                Ok(_) => {
                    self.ctx.ledger.record_enqueued(action);
                }
                Err(QueueError::InvalidAction(err)) => {
                    warn!(action_id = %action.id, error = %err, "action rejected at enqueue");
                    self.ctx.ledger.record_abandoned(action, err.to_string());
                }
                Err(err) => {
                    pool.shutdown().await;
                    return Err(err.into());
                }
            }
        }

        let drained = self.drain(cancel).await;
        let stats = pool.shutdown().await;

        let summary = self.summarize(&ids, plan.users_analyzed, plan.projected_monthly_savings);
        self.log_summary(&summary, &stats, drained);
        for issue in self.ctx.inventory.seat_discrepancies() {
            warn!(product = %issue.product, issue = ?issue.kind, "seat count drift after run");
        }
        Ok(summary)
    }

    /// Reconcile, then optimize and drain, every `interval` until cancelled.
    /// A failed phase is logged and retried next cycle.
    pub async fn run_forever(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.sync.reconcile().await {
                warn!(error = %err, "reconciliation failed; retrying next cycle");
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.run_once(&cancel).await {
                error!(error = %err, "optimization run failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("orchestrator stopped");
    }

    /// `true` once the queue is empty, `false` on cancellation.
    async fn drain(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.ctx.queue.wait_drained() => true,
        }
    }

    fn summarize(&self, ids: &HashSet<ActionId>, users_analyzed: usize, savings: Money) -> RunSummary {
        let mut committed = HashSet::new();
        let mut abandoned = HashSet::new();
        for record in self.ctx.ledger.records() {
            if !ids.contains(&record.action_id) {
                continue;
            }
            match record.outcome {
                SyncOutcome::Committed => {
                    committed.insert(record.action_id);
                }
                SyncOutcome::Abandoned { .. } => {
                    abandoned.insert(record.action_id);
                }
                _ => {}
            }
        }
        let settled = committed.len() + abandoned.len();
        RunSummary {
            users_analyzed,
            actions_proposed: ids.len(),
            actions_committed: committed.len(),
            actions_failed: ids.len().saturating_sub(settled),
            actions_abandoned: abandoned.len(),
            projected_savings: savings,
        }
    }

    fn log_summary(&self, summary: &RunSummary, stats: &WorkerStats, drained: bool) {
        info!(
            users_analyzed = summary.users_analyzed,
            proposed = summary.actions_proposed,
            committed = summary.actions_committed,
            failed = summary.actions_failed,
            abandoned = summary.actions_abandoned,
            savings_cents = summary.projected_savings.cents(),
            requeues = stats.jobs_requeued,
            deferrals = stats.jobs_deferred,
            drained,
            "run finished"
        );
    }
}
