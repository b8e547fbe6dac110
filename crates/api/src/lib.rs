//! HTTP gateway for the order and wallet services.
//!
//! Exposes the order lifecycle, wallet and companion operations over
//! JSON, with structured logging (tracing) and Prometheus metrics. The
//! background workers of the saga run beside the server in `main`.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use order::OrderStore;
use outbox::OutboxStore;
use saga::Platform;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use wallet::UserStore;

use config::{ConfigHandle, PoolManager};

/// Storage of the user and wallet service.
pub trait UserBackend: UserStore + OutboxStore + Clone + 'static {}
impl<T: UserStore + OutboxStore + Clone + 'static> UserBackend for T {}

/// Storage of the order service.
pub trait OrderBackend: OrderStore + OutboxStore + Clone + 'static {}
impl<T: OrderStore + OutboxStore + Clone + 'static> OrderBackend for T {}

/// Shared application state accessible from all handlers.
pub struct AppState<U, O> {
    pub platform: Arc<Platform<U, O>>,
    pub config: ConfigHandle,
    pub pools: Arc<PoolManager>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<U: UserBackend, O: OrderBackend>(
    state: Arc<AppState<U, O>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::scrape))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<U, O>))
        .route("/orders", post(routes::orders::create::<U, O>))
        .route("/orders/{id}", get(routes::orders::get::<U, O>))
        .route("/orders/{id}/accept", post(routes::orders::accept::<U, O>))
        .route("/orders/{id}/start", post(routes::orders::start::<U, O>))
        .route("/orders/{id}/complete", post(routes::orders::complete::<U, O>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<U, O>))
        .route("/orders/{id}/rate", post(routes::orders::rate::<U, O>))
        .route("/users/{id}/orders", get(routes::orders::list_for_user::<U, O>))
        .route("/wallets/{user_id}", get(routes::wallets::get::<U, O>))
        .route("/wallets/{user_id}/transactions", get(routes::wallets::transactions::<U, O>))
        .route("/wallets/{user_id}/recharge", post(routes::wallets::recharge::<U, O>))
        .route(
            "/companions/{user_id}",
            get(routes::companions::get::<U, O>).put(routes::companions::upsert::<U, O>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
