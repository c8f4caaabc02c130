//! AI usage quota routes

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use vipdesk_billing::{UsageCounter, UsageSnapshot};
use vipdesk_shared::{MembershipTier, UsageCategory, UserId};

use super::format_datetime;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub user_id: UserId,
    pub tier: MembershipTier,
    pub reset_at: String,
    pub last_used_at: Option<String>,
    pub categories: Vec<UsageCounter>,
}

impl From<UsageSnapshot> for UsageResponse {
    fn from(snapshot: UsageSnapshot) -> Self {
        Self {
            user_id: snapshot.user_id,
            tier: snapshot.tier,
            reset_at: format_datetime(snapshot.reset_at),
            last_used_at: snapshot.last_used_at.map(format_datetime),
            categories: snapshot.categories,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IncrementResponse {
    pub category: UsageCategory,
    pub used_count: i32,
    pub max_count: i32,
    pub remaining: i32,
    pub reset_at: String,
}

pub async fn get_usage(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<UsageResponse>> {
    let snapshot = state.billing.quota.get_usage(user_id).await?;
    Ok(Json(snapshot.into()))
}

/// Consume one unit; 402 `QUOTA_EXCEEDED` at the ceiling
pub async fn increment_usage(
    State(state): State<AppState>,
    Path((user_id, category)): Path<(UserId, String)>,
) -> ApiResult<Json<IncrementResponse>> {
    let category: UsageCategory = category.parse().map_err(ApiError::Validation)?;

    let record = state.billing.quota.increment(user_id, category).await?;
    let counter = record.counter(category);
    Ok(Json(IncrementResponse {
        category,
        used_count: counter.used_count,
        max_count: counter.max_count,
        remaining: counter.remaining,
        reset_at: format_datetime(record.reset_at),
    }))
}
