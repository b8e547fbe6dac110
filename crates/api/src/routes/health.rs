//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::{AppState, OrderBackend, UserBackend};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub config_version: u64,
    /// `None` when the services run on in-memory stores.
    pub database: Option<&'static str>,
}

/// GET /health. Pings both databases when pools are configured.
pub async fn check<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let config_version = state.config.snapshot().await.version;

    let database = match state.pools.pools().await {
        None => None,
        Some(pools) => {
            let users = sqlx::query("SELECT 1").execute(&pools.users).await;
            let orders = sqlx::query("SELECT 1").execute(&pools.orders).await;
            match (users, orders) {
                (Ok(_), Ok(_)) => Some("ok"),
                (users, orders) => {
                    tracing::warn!(users = ?users.err(), orders = ?orders.err(), "database ping failed");
                    Some("unavailable")
                }
            }
        }
    };

    let (status, code) = match database {
        Some("unavailable") => ("degraded", StatusCode::SERVICE_UNAVAILABLE),
        _ => ("ok", StatusCode::OK),
    };
    (
        code,
        Json(HealthResponse {
            status,
            config_version,
            database,
        }),
    )
}
