//! Wallet balance and ledger endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::UserId;
use serde::{Deserialize, Serialize};
use wallet::{Wallet, WalletTransaction};

use crate::error::ApiError;
use crate::{AppState, OrderBackend, UserBackend};

#[derive(Deserialize)]
pub struct RechargeRequest {
    pub amount: i64,
    /// Idempotency key; a repeated key returns the first result.
    #[serde(default)]
    pub biz_order_id: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Serialize)]
pub struct RechargeResponse {
    pub wallet: Wallet,
    pub transaction: WalletTransaction,
    pub replayed: bool,
}

/// GET /wallets/{user_id}
pub async fn get<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
) -> Result<Json<Wallet>, ApiError> {
    Ok(Json(state.platform.wallet().get_wallet(UserId::new(user_id)).await?))
}

/// GET /wallets/{user_id}/transactions
pub async fn transactions<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
) -> Result<Json<Vec<WalletTransaction>>, ApiError> {
    Ok(Json(state.platform.wallet().list_transactions(UserId::new(user_id)).await?))
}

/// POST /wallets/{user_id}/recharge
#[tracing::instrument(skip(state, req))]
pub async fn recharge<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
    Json(req): Json<RechargeRequest>,
) -> Result<Json<RechargeResponse>, ApiError> {
    let update = state
        .platform
        .wallet()
        .recharge(UserId::new(user_id), req.amount, &req.biz_order_id, &req.remark)
        .await?;
    Ok(Json(RechargeResponse {
        wallet: update.wallet,
        transaction: update.transaction,
        replayed: update.replayed,
    }))
}
