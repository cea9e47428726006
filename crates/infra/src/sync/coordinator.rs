use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seatflow_allocation::{Action, ActionKind};
use seatflow_core::ActionId;

use crate::context::ProvisioningContext;
use crate::jobs::QueueError;
use crate::remote::provisioning::{
    PRODUCTS_ENDPOINT, ProductsPage, REQUESTS_ENDPOINT, RequestsPage,
};
use crate::remote::{
    ApiError, ExternalRequest, RequestStatus, RetryPolicy, pending_requests_request,
    product_capacity_request,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Requests returned by the remote system.
    pub pulled: usize,
    /// Approvals turned into provision jobs.
    pub enqueued: usize,
    /// Already recorded or still undecided.
    pub skipped: usize,
    pub rejected: usize,
    /// Entries that could not be parsed or turned into a valid action.
    pub invalid: usize,
    pub pools_refreshed: usize,
    /// Refreshed pools now using more seats than they license.
    pub over_deployed: usize,
}

/// Pulls approval decisions and seat capacities from the remote system.
///
/// Re-processing a request number already in the ledger is a no-op, so a
/// failed pass can simply be repeated.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    ctx: ProvisioningContext,
    approval_priority: u8,
    backoff: RetryPolicy,
}

impl SyncCoordinator {
    pub fn new(ctx: ProvisioningContext, approval_priority: u8, backoff: RetryPolicy) -> Self {
        Self {
            ctx,
            approval_priority,
            backoff,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let org_id = self.ctx.client.org_id();
        let response = self.ctx.client.invoke(&pending_requests_request(org_id)).await?;
        let page: RequestsPage = response.decode(REQUESTS_ENDPOINT)?;

        let mut report = ReconcileReport {
            pulled: page.requests.len(),
            ..ReconcileReport::default()
        };

        for raw in page.requests {
            let request: ExternalRequest = match serde_json::from_value(raw) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "skipping malformed external request");
                    report.invalid += 1;
                    continue;
                }
            };
            if request.status == RequestStatus::Pending || self.ctx.ledger.has_request(&request.number) {
                report.skipped += 1;
                continue;
            }
            match request.status {
                RequestStatus::Rejected => {
                    let reason = request.reason.clone().unwrap_or_else(|| "rejected".to_string());
                    self.ctx.ledger.record_rejected(
                        &request.number,
                        request.user.clone(),
                        request.products.clone(),
                        reason,
                    );
                    report.rejected += 1;
                }
                _ => {
                    if self.enqueue_approval(request).await? {
                        report.enqueued += 1;
                    } else {
                        report.invalid += 1;
                    }
                }
            }
        }

        (report.pools_refreshed, report.over_deployed) = self.refresh_pools().await?;
        info!(
            pulled = report.pulled,
            enqueued = report.enqueued,
            skipped = report.skipped,
            rejected = report.rejected,
            invalid = report.invalid,
            pools_refreshed = report.pools_refreshed,
            over_deployed = report.over_deployed,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Returns `false` when the approval does not describe a valid action; it
    /// is recorded as abandoned so later passes skip it.
    async fn enqueue_approval(&self, request: ExternalRequest) -> Result<bool, SyncError> {
        let sequence = self.ctx.take_sequences(1);
        let action = Action::new(
            ActionId::new(),
            sequence,
            request.user.clone(),
            ActionKind::Provision {
                request_number: request.number.clone(),
                products: request.products.clone(),
            },
        );
        if let Some(unknown) = action
            .products()
            .iter()
            .find(|p| self.ctx.inventory.product(p).is_none())
        {
            let reason = format!("unknown product {unknown}");
            warn!(request = %request.number, %reason, "approval not provisionable");
            self.ctx.ledger.record_abandoned(&action, reason);
            return Ok(false);
        }

        if let Err(err) = action.validate() {
            warn!(request = %request.number, error = %err, "approval not provisionable");
            self.ctx.ledger.record_abandoned(&action, err.to_string());
            return Ok(false);
        }

        if self.ctx.inventory.ensure_user(&request.user, &request.department) {
            debug!(user = %request.user, "registered user from external request");
        }
        match self.ctx.queue.enqueue(action.clone(), self.approval_priority).await {
            Ok(job_id) => {
                debug!(request = %request.number, job_id = %job_id, "approval enqueued");
                self.ctx.ledger.record_enqueued(&action);
                Ok(true)
            }
            Err(QueueError::InvalidAction(err)) => {
                warn!(request = %request.number, error = %err, "approval not provisionable");
                self.ctx.ledger.record_abandoned(&action, err.to_string());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Align pool capacities with what the remote system reports. Returns the
    /// number of pools changed and how many of those are now over-deployed.
    async fn refresh_pools(&self) -> Result<(usize, usize), SyncError> {
        let response = self
            .ctx
            .client
            .invoke(&product_capacity_request(self.ctx.client.org_id()))
            .await?;
        let page: ProductsPage = response.decode(PRODUCTS_ENDPOINT)?;

        let mut refreshed = 0;
        let mut over_deployed = 0;
        for capacity in page.products {
            let Some(pool) = self.ctx.inventory.pool(&capacity.id) else {
                debug!(product = %capacity.id, "capacity reported for untracked product");
                continue;
            };
            if pool.total() == capacity.total_quantity {
                continue;
            }
            match self.ctx.inventory.set_pool_total(&capacity.id, capacity.total_quantity) {
                Ok(()) => {
                    info!(
                        product = %capacity.id,
                        total = capacity.total_quantity,
                        "pool capacity updated"
                    );
                    refreshed += 1;
                    let used = pool.used();
                    if used > capacity.total_quantity {
                        warn!(
                            product = %capacity.id,
                            total = capacity.total_quantity,
                            used,
                            "pool over-deployed; no grants until usage drops"
                        );
                        over_deployed += 1;
                    }
                }
                Err(err) => warn!(product = %capacity.id, error = %err, "ignoring pool capacity"),
            }
        }
        Ok((refreshed, over_deployed))
    }

    /// Reconcile every `interval` until cancelled. A failed pass is retried
    /// sooner, with backoff, but never later than the next regular pass.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let wait = match self.reconcile().await {
                Ok(_) => {
                    failures = 0;
                    interval
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let wait = self.backoff.delay_for_attempt(failures).min(interval);
                    warn!(
                        error = %err,
                        failures,
                        retry_in_ms = wait.as_millis() as u64,
                        "reconciliation failed"
                    );
                    wait
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("sync coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::client::testing::ScriptedTransport;
    use crate::remote::{ApiRequest, ApiResponse};
    use crate::test_support::{Fixture, pid, uid};
    use seatflow_allocation::{OptimizationPolicy, SyncOutcome, optimize};
    use seatflow_inventory::{IssueKind, UserStatus, check_compliance};
    use serde_json::{Value, json};

    fn remote(requests: Value, products: Value) -> ScriptedTransport {
        ScriptedTransport::new(vec![]).with_fallback(move |req: &ApiRequest| {
            if req.endpoint == REQUESTS_ENDPOINT {
                ApiResponse::new(200, json!({ "requests": requests.clone() }))
            } else if req.endpoint == PRODUCTS_ENDPOINT {
                ApiResponse::new(200, json!({ "products": products.clone() }))
            } else {
                ApiResponse::new(200, json!({"result": "success"}))
            }
        })
    }

    fn coordinator(fx: &Fixture) -> SyncCoordinator {
        SyncCoordinator::new(fx.ctx.clone(), 2, RetryPolicy::default())
    }

    fn requests() -> Value {
        json!([
            {"number": "RITM0001", "user": "new.hire@x.io", "department": "Marketing",
             "products": ["p1"], "status": "approved"},
            {"number": "RITM0002", "user": "b@x.io", "products": ["p2"],
             "status": "rejected", "reason": "no budget"},
            {"number": "RITM0003", "user": "c@x.io", "products": ["p2"], "status": "pending"},
            {"number": "RITM0004", "products": ["p2"], "status": "approved"}
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn approvals_become_provision_jobs() {
        let fx = Fixture::with_transport(remote(requests(), json!([])), 6);
        let coordinator = coordinator(&fx);

        let report = coordinator.reconcile().await.unwrap();

        assert_eq!(report.pulled, 4);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.invalid, 1);

        let user = fx.ctx.inventory.user(&uid("new.hire@x.io")).unwrap();
        assert_eq!(user.status, UserStatus::Waiting);
        assert_eq!(user.department, "Marketing");

        let claim = fx.ctx.queue.dequeue("w", Duration::ZERO).await.unwrap();
        assert_eq!(claim.job.priority, 2);
        assert_eq!(claim.job.action.request_number(), Some("RITM0001"));
        assert!(fx.ctx.ledger.has_request("RITM0001"));
        assert!(fx.ctx.ledger.has_request("RITM0002"));
        assert!(!fx.ctx.ledger.has_request("RITM0003"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_pass_is_a_no_op() {
        let fx = Fixture::with_transport(remote(requests(), json!([])), 6);
        let coordinator = coordinator(&fx);

        coordinator.reconcile().await.unwrap();
        let records = fx.ctx.ledger.len();
        let report = coordinator.reconcile().await.unwrap();

        assert_eq!(report.enqueued, 0);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(fx.ctx.ledger.len(), records);
        assert_eq!(fx.ctx.queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_product_is_recorded_not_enqueued() {
        let fx = Fixture::with_transport(
            remote(
                json!([{"number": "RITM0009", "user": "z@x.io", "products": ["nope"], "status": "approved"}]),
                json!([]),
            ),
            6,
        );

        let report = coordinator(&fx).reconcile().await.unwrap();

        assert_eq!(report.invalid, 1);
        assert!(fx.ctx.queue.is_empty().await);
        let abandoned = fx.ctx.ledger.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert!(matches!(abandoned[0].outcome, SyncOutcome::Abandoned { .. }));
        assert!(fx.ctx.ledger.has_request("RITM0009"));
        // Nobody was registered, so no later run hands the requester a seat.
        assert!(fx.ctx.inventory.user(&uid("z@x.io")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_capacity_is_refreshed() {
        let fx = Fixture::with_transport(
            remote(
                json!([]),
                json!([
                    {"id": "p1", "totalQuantity": 10},
                    {"id": "p2", "totalQuantity": 2},
                    {"id": "untracked", "totalQuantity": 4}
                ]),
            ),
            6,
        );

        let report = coordinator(&fx).reconcile().await.unwrap();

        assert_eq!(report.pools_refreshed, 1);
        assert_eq!(fx.ctx.inventory.pool(&pid("p1")).unwrap().total(), 10);
        assert_eq!(fx.ctx.inventory.pool(&pid("p2")).unwrap().total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cut_leaves_pool_over_deployed_but_plannable() {
        // p1 has 2 of 3 seats in use; the vendor now licenses only 1.
        let fx = Fixture::with_transport(
            remote(json!([]), json!([{"id": "p1", "totalQuantity": 1}])),
            6,
        );

        let report = coordinator(&fx).reconcile().await.unwrap();
        assert_eq!(report.pools_refreshed, 1);
        assert_eq!(report.over_deployed, 1);

        let snapshot = fx.ctx.inventory.snapshot();
        assert!(check_compliance(&snapshot).iter().any(|issue| {
            issue.product == pid("p1") && issue.kind == IssueKind::OverDeployment { excess: 1 }
        }));

        // Both holders stay active: nothing is reclaimed and the waiting user
        // gets no seat from the over-deployed pool.
        let now = chrono::Utc::now();
        let mut users = snapshot.users.clone();
        for user in &mut users {
            user.last_active = Some(now);
        }
        let policy = OptimizationPolicy::new(now).with_default_product(pid("p1"));
        let plan = optimize(&users, &snapshot.pools, &policy).unwrap();
        assert!(plan.actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pass_is_retried_next_cycle() {
        let fx = Fixture::with_transport(
            remote(requests(), json!([])).with_fallback(|_| ApiResponse::new(400, json!(null))),
            6,
        );
        let coordinator = coordinator(&fx);

        let err = coordinator.reconcile().await.unwrap_err();
        assert!(matches!(err, SyncError::Api(ApiError::Permanent { status: 400, .. })));

        let cancel = CancellationToken::new();
        let run = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.run(Duration::from_secs(900), cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        run.await.unwrap();

        // One failed pass, then a backoff retry (500ms, then 1s) before cancel.
        assert!(fx.transport.call_count() >= 3);
    }
}
