//! Purchase order routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use vipdesk_billing::{ConfirmedOrder, VipOrder};
use vipdesk_shared::{OrderId, OrderStatus, PlanId, RecordId, UserId};

use super::format_datetime;
use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub plan_id: PlanId,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub order_no: String,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub amount: String,
    pub amount_cents: i64,
    pub status: OrderStatus,
    pub created_at: String,
    pub paid_at: Option<String>,
    pub cancelled_at: Option<String>,
}

impl From<VipOrder> for OrderResponse {
    fn from(order: VipOrder) -> Self {
        Self {
            id: order.id,
            amount: order.amount(),
            user_id: order.user_id,
            plan_id: order.plan_id,
            amount_cents: order.amount_cents,
            status: order.status,
            created_at: format_datetime(order.created_at),
            paid_at: order.paid_at.map(format_datetime),
            cancelled_at: order.cancelled_at.map(format_datetime),
            order_no: order.order_no,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfirmOrderResponse {
    pub status: OrderStatus,
    pub active_until: String,
    pub record_id: RecordId,
    pub repaired: bool,
    pub order: OrderResponse,
}

impl From<ConfirmedOrder> for ConfirmOrderResponse {
    fn from(confirmed: ConfirmedOrder) -> Self {
        Self {
            status: confirmed.order.status,
            active_until: format_datetime(confirmed.active_until()),
            record_id: confirmed.record.id,
            repaired: confirmed.repaired,
            order: confirmed.order.into(),
        }
    }
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<OrderResponse>)> {
    let order = state
        .billing
        .orders
        .create_order(req.user_id, req.plan_id)
        .await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.billing.orders.get_order(order_id).await?;
    Ok(Json(order.into()))
}

pub async fn get_order_by_no(
    State(state): State<AppState>,
    Path(order_no): Path<String>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.billing.orders.get_order_by_no(&order_no).await?;
    Ok(Json(order.into()))
}

pub async fn confirm_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> ApiResult<Json<ConfirmOrderResponse>> {
    let confirmed = state.billing.orders.confirm_order(order_id).await?;
    Ok(Json(confirmed.into()))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.billing.orders.cancel_order(order_id).await?;
    Ok(Json(order.into()))
}

pub async fn list_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<Vec<OrderResponse>>> {
    let orders = state.billing.orders.list_orders(user_id).await?;
    Ok(Json(orders.into_iter().map(OrderResponse::from).collect()))
}
