//! Companion profile endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::UserId;
use serde::{Deserialize, Serialize};
use wallet::{CompanionProfile, CompanionStatus, UserStats};

use crate::error::ApiError;
use crate::{AppState, OrderBackend, UserBackend};

#[derive(Deserialize)]
pub struct UpsertCompanionRequest {
    pub price_per_hour: i64,
    pub status: Option<CompanionStatus>,
}

#[derive(Serialize)]
pub struct CompanionResponse {
    #[serde(flatten)]
    pub profile: CompanionProfile,
    pub follower_count: i64,
    pub following_count: i64,
}

/// PUT /companions/{user_id}
#[tracing::instrument(skip(state, req))]
pub async fn upsert<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
    Json(req): Json<UpsertCompanionRequest>,
) -> Result<Json<CompanionProfile>, ApiError> {
    let profile = state
        .platform
        .companions()
        .upsert_companion(UserId::new(user_id), req.price_per_hour, req.status)
        .await?;
    Ok(Json(profile))
}

/// GET /companions/{user_id}
pub async fn get<U: UserBackend, O: OrderBackend>(
    State(state): State<Arc<AppState<U, O>>>,
    Path(user_id): Path<u64>,
) -> Result<Json<CompanionResponse>, ApiError> {
    let user_id = UserId::new(user_id);
    let companions = state.platform.companions();
    let profile = companions.get_companion(user_id).await?;
    let UserStats {
        follower_count,
        following_count,
        ..
    } = companions.get_user_stats(user_id).await?;
    Ok(Json(CompanionResponse {
        profile,
        follower_count,
        following_count,
    }))
}
