//! Wire shapes of the provisioning service's user-management API.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use seatflow_allocation::{Action, ActionKind};
use seatflow_core::{ProductId, UserId};

use super::types::ApiRequest;

/// Logical endpoint names; each gets its own circuit breaker.
pub const ACTION_ENDPOINT: &str = "usermanagement.action";
pub const REQUESTS_ENDPOINT: &str = "usermanagement.requests";
pub const PRODUCTS_ENDPOINT: &str = "usermanagement.products";

/// `POST /v2/usermanagement/action/{org}` carrying the add/remove commands of
/// one action. The action id travels as `requestID` so the remote side can
/// drop duplicates.
pub fn action_request(org_id: &str, action: &Action) -> ApiRequest {
    let command = match &action.kind {
        ActionKind::Reclaim { products } | ActionKind::Downgrade { products, .. } => {
            json!({ "remove": { "product": products } })
        }
        ActionKind::Reassign { products } | ActionKind::Provision { products, .. } => {
            json!({ "add": { "product": products } })
        }
    };
    ApiRequest::post(
        ACTION_ENDPOINT,
        format!("/v2/usermanagement/action/{org_id}"),
        json!({
            "user": { "email": action.user_id },
            "requestID": action.id.to_string(),
            "do": [command],
        }),
    )
}

/// External approval decisions not yet acknowledged.
pub fn pending_requests_request(org_id: &str) -> ApiRequest {
    ApiRequest::get(REQUESTS_ENDPOINT, format!("/v2/usermanagement/requests/{org_id}"))
        .with_query("state", "decided")
}

pub fn product_capacity_request(org_id: &str) -> ApiRequest {
    ApiRequest::get(PRODUCTS_ENDPOINT, format!("/v2/usermanagement/products/{org_id}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// A license request raised outside this system (service desk ticket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRequest {
    pub number: String,
    pub user: UserId,
    #[serde(default)]
    pub department: String,
    pub products: Vec<ProductId>,
    pub status: RequestStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RequestsPage {
    #[serde(default)]
    pub requests: Vec<Value>,
}

/// Seat capacity the remote system reports for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCapacity {
    pub id: ProductId,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProductsPage {
    #[serde(default)]
    pub products: Vec<ProductCapacity>,
}
