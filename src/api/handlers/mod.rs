//! Request handlers, one module per resource kind.

pub mod credentials;
pub mod devnets;
pub mod nodes;
pub mod transactions;
pub mod upgrades;

use axum::Json;

use super::dto::HealthResponse;

/// Daemon liveness; served outside authentication.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
