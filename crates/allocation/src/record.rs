use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use seatflow_core::{ActionId, ProductId, UserId};
use seatflow_inventory::UserState;

use crate::action::Action;
use crate::commit::AppliedChange;

/// How an action (or external request) left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Committed,
    Abandoned { reason: String },
    /// External approval turned into a queued provision action.
    Enqueued,
    /// External request rejected upstream; nothing is provisioned.
    Rejected { reason: String },
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub action_id: ActionId,
    pub sequence: u64,
    pub user_id: UserId,
    pub product_ids: Vec<ProductId>,
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<UserState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<UserState>,
    pub committed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

impl SyncRecord {
    fn for_action(action: &Action, outcome: SyncOutcome, at: DateTime<Utc>) -> Self {
        Self {
            action_id: action.id,
            sequence: action.sequence,
            user_id: action.user_id.clone(),
            product_ids: action.products().to_vec(),
            action_type: action.type_name().to_string(),
            request_number: action.request_number().map(str::to_string),
            before_state: None,
            after_state: None,
            committed_at: at,
            outcome,
        }
    }

    pub fn committed(action: &Action, change: &AppliedChange, at: DateTime<Utc>) -> Self {
        Self {
            before_state: Some(change.before.clone()),
            after_state: Some(change.after.clone()),
            ..Self::for_action(action, SyncOutcome::Committed, at)
        }
    }

    pub fn abandoned(action: &Action, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::for_action(action, SyncOutcome::Abandoned { reason: reason.into() }, at)
    }

    pub fn enqueued(action: &Action, at: DateTime<Utc>) -> Self {
        Self::for_action(action, SyncOutcome::Enqueued, at)
    }

    /// Rejected external request. No action exists, so a fresh id is minted.
    pub fn rejected(
        request_number: impl Into<String>,
        user_id: UserId,
        product_ids: Vec<ProductId>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            action_id: ActionId::new(),
            sequence: 0,
            user_id,
            product_ids,
            action_type: "provision".to_string(),
            request_number: Some(request_number.into()),
            before_state: None,
            after_state: None,
            committed_at: at,
            outcome: SyncOutcome::Rejected {
                reason: reason.into(),
            },
        }
    }

    pub fn is_committed(&self) -> bool {
        self.outcome == SyncOutcome::Committed
    }
}
