//! Subscription routes
//!
//! Reads go straight to the ledger; `sync` is the explicit read-and-repair path.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use vipdesk_billing::{ActiveSubscription, EntitlementState, ReconcileOutcome, VipRecord};
use vipdesk_shared::{OrderId, PlanId, RecordId, UserId};

use super::format_datetime;
use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub is_vip: bool,
    pub expires_at: String,
    pub started_at: String,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub record_id: RecordId,
    pub order_id: Option<OrderId>,
}

impl From<ActiveSubscription> for SubscriptionResponse {
    fn from(active: ActiveSubscription) -> Self {
        Self {
            is_vip: true,
            expires_at: format_datetime(active.expires_at),
            started_at: format_datetime(active.start_at),
            plan_id: active.plan_id,
            plan_name: active.plan_name,
            record_id: active.record_id,
            order_id: active.order_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub user_id: UserId,
    pub is_vip: bool,
    /// Empty when the user is not VIP
    pub expires_at: String,
    pub state: EntitlementState,
    pub expired_records: usize,
    pub superseded_records: usize,
    pub projection_updated: bool,
}

impl From<ReconcileOutcome> for SyncResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            user_id: outcome.user_id,
            is_vip: outcome.is_vip,
            expires_at: outcome.expires_at.map(format_datetime).unwrap_or_default(),
            state: outcome.state,
            expired_records: outcome.expired_records,
            superseded_records: outcome.superseded_records,
            projection_updated: outcome.projection_updated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub id: RecordId,
    pub plan_id: PlanId,
    pub order_id: Option<OrderId>,
    pub is_active: bool,
    pub start_at: String,
    pub end_at: String,
    pub created_at: String,
}

impl From<VipRecord> for RecordResponse {
    fn from(record: VipRecord) -> Self {
        Self {
            id: record.id,
            plan_id: record.plan_id,
            order_id: record.order_id,
            is_active: record.is_active,
            start_at: format_datetime(record.start_at),
            end_at: format_datetime(record.end_at),
            created_at: format_datetime(record.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub plan_id: PlanId,
}

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub user_id: UserId,
    pub deactivated_records: u64,
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub user_id: UserId,
    pub is_vip: bool,
}

/// Current subscription, or `null` when the user has none
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<Option<SubscriptionResponse>>> {
    let active = state.billing.ledger.active_subscription(user_id).await?;
    Ok(Json(active.map(SubscriptionResponse::from)))
}

pub async fn sync_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<SyncResponse>> {
    let outcome = state.billing.sync.sync_subscription(user_id).await?;
    Ok(Json(outcome.into()))
}

pub async fn grant_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(req): Json<GrantRequest>,
) -> ApiResult<(StatusCode, Json<RecordResponse>)> {
    let record = state.billing.ledger.grant(user_id, req.plan_id).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

pub async fn deactivate_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<DeactivateResponse>> {
    let deactivated_records = state.billing.ledger.deactivate(user_id).await?;
    Ok(Json(DeactivateResponse {
        user_id,
        deactivated_records,
    }))
}

pub async fn subscription_history(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<Vec<RecordResponse>>> {
    let records = state.billing.ledger.list_records(user_id).await?;
    Ok(Json(records.into_iter().map(RecordResponse::from).collect()))
}

pub async fn check_entitlement(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<EntitlementResponse>> {
    let is_vip = state.billing.ledger.check_entitlement(user_id).await?;
    Ok(Json(EntitlementResponse { user_id, is_vip }))
}
