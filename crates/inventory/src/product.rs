use serde::{Deserialize, Serialize};

use seatflow_core::{Entity, Money, ProductId};

/// Product family, used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    /// Bundle of applications sold as one seat.
    Suite,
    /// A single application.
    SingleApp,
    /// Storage, fonts, stock and similar add-ons.
    Service,
}

/// Licensed product (immutable reference data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Monthly cost of one seat.
    pub cost_per_seat: Money,
    pub category: ProductCategory,
}

impl Product {
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        cost_per_seat: Money,
        category: ProductCategory,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            cost_per_seat,
            category,
        }
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
