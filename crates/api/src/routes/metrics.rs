//! Prometheus scrape endpoint.
//!
//! The workers record `outbox_events_dispatched_total`,
//! `transactional_messages_total`, `transactional_checks_total`,
//! `consumer_messages_total`, `wallet_balance_updates_total`,
//! `order_transitions_total` and `config_reloads_total`, plus latency
//! histograms.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics
pub async fn scrape(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    // Histogram buckets are only drained on upkeep.
    handle.run_upkeep();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
