//! Plan catalog routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use vipdesk_billing::{NewPlan, VipPlan};
use vipdesk_shared::{format_cents, PlanId};

use super::format_datetime;
use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub id: PlanId,
    pub name: String,
    /// Decimal price, e.g. "19.90"
    pub price: String,
    pub price_cents: i64,
    pub duration_days: i32,
    pub features: Vec<String>,
    pub created_at: String,
}

impl From<VipPlan> for PlanResponse {
    fn from(plan: VipPlan) -> Self {
        Self {
            id: plan.id,
            price: format_cents(plan.price_cents),
            price_cents: plan.price_cents,
            duration_days: plan.duration_days,
            features: plan.features.0,
            created_at: format_datetime(plan.created_at),
            name: plan.name,
        }
    }
}

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanResponse>>> {
    let plans = state.billing.plans.list_plans().await?;
    Ok(Json(plans.into_iter().map(PlanResponse::from).collect()))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
) -> ApiResult<Json<PlanResponse>> {
    let plan = state.billing.plans.get_plan(plan_id).await?;
    Ok(Json(plan.into()))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<PlanResponse>)> {
    let plan = state.billing.plans.create_plan(req).await?;
    Ok((StatusCode::CREATED, Json(plan.into())))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
) -> ApiResult<StatusCode> {
    state.billing.plans.delete_plan(plan_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
