use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use seatflow_core::{Entity, ProductId, UserId};

/// License holder lifecycle status.
///
/// Users are never deleted; reclaimed users end up `Deprovisioned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Holds at least one seat.
    Active,
    /// Known to the directory and waiting for a seat.
    Waiting,
    /// All seats reclaimed.
    Deprovisioned,
}

/// A license holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub department: String,
    pub status: UserStatus,
    /// Assigned products in assignment order (first = earliest).
    #[serde(default)]
    pub products: Vec<ProductId>,
    /// Last recorded product usage; `None` when the user never used a seat.
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: UserId, department: impl Into<String>, status: UserStatus) -> Self {
        Self {
            id,
            department: department.into(),
            status,
            products: Vec::new(),
            last_active: None,
        }
    }

    pub fn with_products(mut self, products: impl IntoIterator<Item = ProductId>) -> Self {
        self.products = products.into_iter().collect();
        self
    }

    pub fn with_last_active(mut self, at: DateTime<Utc>) -> Self {
        self.last_active = Some(at);
        self
    }

    pub fn holds(&self, product: &ProductId) -> bool {
        self.products.contains(product)
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn state(&self) -> UserState {
        UserState {
            status: self.status,
            products: self.products.clone(),
        }
    }
}

impl Entity for User {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// The mutable part of a user, captured before/after each committed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub status: UserStatus,
    pub products: Vec<ProductId>,
}
