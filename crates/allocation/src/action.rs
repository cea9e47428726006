use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use seatflow_core::{ActionId, DomainError, ProductId, UserId};

/// One license change for one user.
///
/// Immutable once enqueued. `sequence` orders actions of a run and is kept in
/// the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    pub sequence: u64,
    pub user_id: UserId,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Tagged action variant. `products` always lists the affected products.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ActionKind {
    /// Remove every listed product; the user ends up deprovisioned.
    Reclaim { products: Vec<ProductId> },
    /// Keep `retained`, remove the listed products.
    Downgrade {
        retained: ProductId,
        products: Vec<ProductId>,
    },
    /// Grant a waiting user the default product.
    Reassign { products: Vec<ProductId> },
    /// Grant the products of an externally approved request.
    Provision {
        request_number: String,
        products: Vec<ProductId>,
    },
}

/// Lifecycle of an action inside the provisioning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    InFlight,
    Committed,
    Failed,
    Abandoned,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Committed | ActionStatus::Abandoned)
    }
}

impl Action {
    pub fn new(id: ActionId, sequence: u64, user_id: UserId, kind: ActionKind) -> Self {
        Self {
            id,
            sequence,
            user_id,
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::Reclaim { .. } => "reclaim",
            ActionKind::Downgrade { .. } => "downgrade",
            ActionKind::Reassign { .. } => "reassign",
            ActionKind::Provision { .. } => "provision",
        }
    }

    pub fn products(&self) -> &[ProductId] {
        match &self.kind {
            ActionKind::Reclaim { products }
            | ActionKind::Downgrade { products, .. }
            | ActionKind::Reassign { products }
            | ActionKind::Provision { products, .. } => products,
        }
    }

    /// Products that need a fresh seat before the action can commit.
    pub fn seats_required(&self) -> &[ProductId] {
        match &self.kind {
            ActionKind::Reassign { products } | ActionKind::Provision { products, .. } => products,
            ActionKind::Reclaim { .. } | ActionKind::Downgrade { .. } => &[],
        }
    }

    /// Products whose seats go back to the pool once the action commits.
    pub fn seats_released(&self) -> &[ProductId] {
        match &self.kind {
            ActionKind::Reclaim { products } | ActionKind::Downgrade { products, .. } => products,
            ActionKind::Reassign { .. } | ActionKind::Provision { .. } => &[],
        }
    }

    pub fn request_number(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Provision { request_number, .. } => Some(request_number),
            _ => None,
        }
    }

    /// Shape checks run before an action may enter the durable queue.
    pub fn validate(&self) -> Result<(), DomainError> {
        let products = self.products();
        if products.is_empty() {
            return Err(DomainError::validation(format!(
                "{} for {} lists no products",
                self.type_name(),
                self.user_id
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = products.iter().find(|p| !seen.insert(*p)) {
            return Err(DomainError::validation(format!(
                "{} for {} lists product {dup} twice",
                self.type_name(),
                self.user_id
            )));
        }
        match &self.kind {
            ActionKind::Downgrade { retained, products } if products.contains(retained) => {
                Err(DomainError::validation(format!(
                    "downgrade for {} both retains and removes {retained}",
                    self.user_id
                )))
            }
            ActionKind::Reassign { products } if products.len() != 1 => Err(
                DomainError::validation(format!("reassign for {} must grant one product", self.user_id)),
            ),
            ActionKind::Provision { request_number, .. } if request_number.trim().is_empty() => Err(
                DomainError::validation(format!("provision for {} has no request number", self.user_id)),
            ),
            _ => Ok(()),
        }
    }
}
