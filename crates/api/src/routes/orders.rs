//! Order lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::{OrderId, UserId};
use order::{CancelOrder, CreateOrder, Order, OrderAction, RateOrder};
use serde::Deserialize;

use crate::error::ApiError;
use crate::{AppState, OrderBackend, UserBackend};

// -- Request types --

#[derive(Deserialize)]
pub struct OperatorRequest {
    pub operator_id: UserId,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub operator_id: UserId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct RateRequest {
    pub operator_id: UserId,
    pub rating: i16,
    #[serde(default)]
    pub comment: String,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

// -- Handlers --

/// POST /orders
#[tracing::instrument(skip(state, cmd))]
pub async fn create<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Json(cmd): Json<CreateOrder>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let order = state.platform.orders().create_order(cmd).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{id}
pub async fn get<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(state.platform.orders().get_order(OrderId::new(id)).await?))
}

/// GET /users/{id}/orders?limit=N
pub async fn list_for_user<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state.platform.orders().list_orders(UserId::new(user_id), query.limit).await?;
    Ok(Json(orders))
}

/// POST /orders/{id}/accept
#[tracing::instrument(skip(state, req))]
pub async fn accept<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Order>, ApiError> {
    let cmd = OrderAction::new(OrderId::new(id), req.operator_id);
    Ok(Json(state.platform.orders().accept_order(cmd).await?))
}

/// POST /orders/{id}/start
#[tracing::instrument(skip(state, req))]
pub async fn start<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Order>, ApiError> {
    let cmd = OrderAction::new(OrderId::new(id), req.operator_id);
    Ok(Json(state.platform.orders().start_order(cmd).await?))
}

/// POST /orders/{id}/complete
#[tracing::instrument(skip(state, req))]
pub async fn complete<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Order>, ApiError> {
    let cmd = OrderAction::new(OrderId::new(id), req.operator_id);
    Ok(Json(state.platform.orders().complete_order(cmd).await?))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<Order>, ApiError> {
    let cmd = CancelOrder::new(OrderId::new(id), req.operator_id, req.reason);
    Ok(Json(state.platform.orders().cancel_order(cmd).await?))
}

/// POST /orders/{id}/rate
#[tracing::instrument(skip(state, req))]
pub async fn rate<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(id): Path<u64>,
    Json(req): Json<RateRequest>,
) -> Result<Json<Order>, ApiError> {
    let cmd = RateOrder::new(OrderId::new(id), req.operator_id, req.rating, req.comment);
    Ok(Json(state.platform.orders().rate_order(cmd).await?))
}
