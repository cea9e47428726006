//! Process wiring for the seatflow daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use seatflow_infra::Config;
use seatflow_infra::remote::{HttpTransport, Transport};
use seatflow_inventory::InventorySnapshot;

/// Bearer token for the provisioning API.
pub const TOKEN_ENV: &str = "SEATFLOW_API_TOKEN";
/// Client id sent as `X-Api-Key`.
pub const API_KEY_ENV: &str = "SEATFLOW_API_KEY";

/// Read the inventory snapshot the daemon starts from. Without a path the
/// daemon starts empty and learns users from approved requests.
pub fn load_inventory(path: Option<&Path>) -> anyhow::Result<InventorySnapshot> {
    let Some(path) = path else {
        tracing::warn!("no inventoryPath configured; starting from an empty inventory");
        return Ok(InventorySnapshot::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory snapshot {}", path.display()))?;
    let snapshot: InventorySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parsing inventory snapshot {}", path.display()))?;
    snapshot
        .validate()
        .with_context(|| format!("validating inventory snapshot {}", path.display()))?;
    Ok(snapshot)
}

/// HTTP transport for the configured remote, authenticated from the
/// environment.
pub fn http_transport(
    config: &Config,
    token: Option<String>,
    api_key: Option<String>,
) -> anyhow::Result<Arc<dyn Transport>> {
    let mut transport = HttpTransport::new(config.remote.base_url.clone(), config.request_timeout())
        .context("building HTTP client")?;
    match token {
        Some(token) => transport = transport.with_bearer_token(token),
        None => tracing::warn!("{TOKEN_ENV} not set; calling the provisioning API unauthenticated"),
    }
    if let Some(key) = api_key {
        transport = transport.with_api_key(key);
    }
    Ok(Arc::new(transport))
}
