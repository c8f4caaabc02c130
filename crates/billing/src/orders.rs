//! Order manager
//!
//! Purchase orders move `pending -> paid` or `pending -> cancelled`, never back.
//! Confirmation marks the order paid and activates the subscription in a single
//! transaction. A paid order that somehow lacks its subscription record is repaired by
//! confirming it again; if that repair cannot activate, the caller gets
//! [`BillingError::NeedsReconciliation`] instead of a generic failure.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::macros::format_description;
use time::OffsetDateTime;
use vipdesk_shared::{format_cents, OrderId, OrderStatus, PlanId, UserId};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{activate_in, ensure_user_exists, VipRecord, RECORD_COLUMNS};
use crate::plans::fetch_plan;
use crate::retry::{with_conflict_retry, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VipOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub order_no: String,
    /// Plan price at the time the order was created
    pub amount_cents: i64,
    pub status: OrderStatus,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl VipOrder {
    /// Price as a decimal string, e.g. `"19.90"`
    pub fn amount(&self) -> String {
        format_cents(self.amount_cents)
    }
}

/// A paid order together with the subscription record it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedOrder {
    pub order: VipOrder,
    pub record: VipRecord,
    /// The order was already paid and only its missing record was created
    pub repaired: bool,
}

impl ConfirmedOrder {
    pub fn active_until(&self) -> OffsetDateTime {
        self.record.end_at
    }
}

const ORDER_COLUMNS: &str = "id, user_id, plan_id, order_no, amount_cents, status, created_at, \
    paid_at, cancelled_at, updated_at";

/// `ORD` + UTC `YYYYMMDDhhmmss` + user id + `-` + 8 random hex chars
pub fn generate_order_no(user_id: UserId, at: OffsetDateTime) -> BillingResult<String> {
    let stamp = at
        .to_offset(time::UtcOffset::UTC)
        .format(format_description!("[year][month][day][hour][minute][second]"))
        .map_err(|e| BillingError::Internal(format!("Failed to format order timestamp: {}", e)))?;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(format!("ORD{}{}-{}", stamp, user_id, &suffix[..8]))
}

async fn lock_order(conn: &mut PgConnection, order_id: OrderId) -> BillingResult<VipOrder> {
    let order: Option<VipOrder> = sqlx::query_as(&format!(
        "SELECT {} FROM vip_orders WHERE id = $1 FOR UPDATE",
        ORDER_COLUMNS
    ))
    .bind(order_id)
    .fetch_optional(conn)
    .await?;
    order.ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_id)))
}

async fn linked_record(
    conn: &mut PgConnection,
    order_id: OrderId,
) -> BillingResult<Option<VipRecord>> {
    let record = sqlx::query_as(&format!(
        "SELECT {} FROM vip_records WHERE order_id = $1",
        RECORD_COLUMNS
    ))
    .bind(order_id)
    .fetch_optional(conn)
    .await?;
    Ok(record)
}

#[derive(Clone)]
pub struct OrderManager {
    pool: PgPool,
    retry: RetryPolicy,
}

impl OrderManager {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Create a pending order priced at the plan's current price. Grants nothing.
    pub async fn create_order(&self, user_id: UserId, plan_id: PlanId) -> BillingResult<VipOrder> {
        with_conflict_retry(&self.retry, "orders.create", || async {
            let mut tx = self.pool.begin().await?;
            ensure_user_exists(&mut tx, user_id).await?;
            let plan = fetch_plan(&mut tx, plan_id).await?;
            let order_no = generate_order_no(user_id, OffsetDateTime::now_utc())?;

            let order: VipOrder = sqlx::query_as(&format!(
                r#"
                INSERT INTO vip_orders (user_id, plan_id, order_no, amount_cents, status)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {}
                "#,
                ORDER_COLUMNS
            ))
            .bind(user_id)
            .bind(plan_id)
            .bind(&order_no)
            .bind(plan.price_cents)
            .bind(OrderStatus::Pending)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::info!(
                user_id = %user_id,
                plan_id = %plan_id,
                order_id = %order.id,
                order_no = %order.order_no,
                amount = %order.amount(),
                "VIP order created"
            );
            Ok(order)
        })
        .await
    }

    /// Mark a pending order paid and activate its subscription.
    ///
    /// Re-confirming a paid order whose record is missing performs the activation;
    /// re-confirming a fulfilled or cancelled order is `InvalidState`.
    pub async fn confirm_order(&self, order_id: OrderId) -> BillingResult<ConfirmedOrder> {
        with_conflict_retry(&self.retry, "orders.confirm", || async {
            let mut tx = self.pool.begin().await?;
            let order = lock_order(&mut tx, order_id).await?;

            match order.status {
                OrderStatus::Pending => {
                    let confirmed = self.pay_and_activate(&mut tx, order).await?;
                    tx.commit().await?;

                    tracing::info!(
                        user_id = %confirmed.order.user_id,
                        order_id = %order_id,
                        record_id = %confirmed.record.id,
                        active_until = %confirmed.record.end_at,
                        "VIP order paid"
                    );
                    Ok(confirmed)
                }
                OrderStatus::Paid => {
                    if linked_record(&mut tx, order_id).await?.is_some() {
                        return Err(BillingError::InvalidState(format!(
                            "Order {} is already paid",
                            order_id
                        )));
                    }
                    let confirmed = self.repair_in(&mut tx, order).await?;
                    tx.commit().await?;
                    Ok(confirmed)
                }
                OrderStatus::Cancelled => Err(BillingError::InvalidState(format!(
                    "Order {} is cancelled",
                    order_id
                ))),
            }
        })
        .await
    }

    async fn pay_and_activate(
        &self,
        conn: &mut PgConnection,
        order: VipOrder,
    ) -> BillingResult<ConfirmedOrder> {
        let now = OffsetDateTime::now_utc();
        let plan = fetch_plan(&mut *conn, order.plan_id).await?;
        let end_at = plan.end_from(now)?;

        let paid: VipOrder = sqlx::query_as(&format!(
            r#"
            UPDATE vip_orders
            SET status = $2, paid_at = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order.id)
        .bind(OrderStatus::Paid)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        let record = activate_in(
            &mut *conn,
            paid.user_id,
            paid.plan_id,
            Some(paid.id),
            now,
            end_at,
        )
        .await?;

        Ok(ConfirmedOrder {
            order: paid,
            record,
            repaired: false,
        })
    }

    /// Activate for a paid order that has no record yet
    async fn repair_in(
        &self,
        conn: &mut PgConnection,
        order: VipOrder,
    ) -> BillingResult<ConfirmedOrder> {
        let order_id = order.id;
        tracing::warn!(
            user_id = %order.user_id,
            order_id = %order_id,
            "Paid VIP order has no subscription record, activating"
        );

        let activation = async {
            let plan = fetch_plan(&mut *conn, order.plan_id).await?;
            let now = OffsetDateTime::now_utc();
            let end_at = plan.end_from(now)?;
            activate_in(
                &mut *conn,
                order.user_id,
                order.plan_id,
                Some(order.id),
                now,
                end_at,
            )
            .await
        }
        .await;

        match activation {
            Ok(record) => {
                tracing::info!(
                    user_id = %order.user_id,
                    order_id = %order_id,
                    record_id = %record.id,
                    "Repaired paid VIP order"
                );
                Ok(ConfirmedOrder {
                    order,
                    record,
                    repaired: true,
                })
            }
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                tracing::error!(
                    order_id = %order_id,
                    error = %err,
                    "Paid VIP order could not be activated"
                );
                Err(BillingError::NeedsReconciliation {
                    order_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Cancel a pending order. No ledger effect.
    pub async fn cancel_order(&self, order_id: OrderId) -> BillingResult<VipOrder> {
        with_conflict_retry(&self.retry, "orders.cancel", || async {
            let mut tx = self.pool.begin().await?;
            let order = lock_order(&mut tx, order_id).await?;

            if !order.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(BillingError::InvalidState(format!(
                    "Order {} is {} and cannot be cancelled",
                    order_id, order.status
                )));
            }

            let cancelled: VipOrder = sqlx::query_as(&format!(
                r#"
                UPDATE vip_orders
                SET status = $2, cancelled_at = NOW(), updated_at = NOW()
                WHERE id = $1
                RETURNING {}
                "#,
                ORDER_COLUMNS
            ))
            .bind(order_id)
            .bind(OrderStatus::Cancelled)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::info!(
                user_id = %cancelled.user_id,
                order_id = %order_id,
                "VIP order cancelled"
            );
            Ok(cancelled)
        })
        .await
    }

    pub async fn get_order(&self, order_id: OrderId) -> BillingResult<VipOrder> {
        let order: Option<VipOrder> = sqlx::query_as(&format!(
            "SELECT {} FROM vip_orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        order.ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_id)))
    }

    pub async fn get_order_by_no(&self, order_no: &str) -> BillingResult<VipOrder> {
        let order: Option<VipOrder> = sqlx::query_as(&format!(
            "SELECT {} FROM vip_orders WHERE order_no = $1",
            ORDER_COLUMNS
        ))
        .bind(order_no)
        .fetch_optional(&self.pool)
        .await?;
        order.ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_no)))
    }

    /// A user's orders, newest first
    pub async fn list_orders(&self, user_id: UserId) -> BillingResult<Vec<VipOrder>> {
        let mut conn = self.pool.acquire().await?;
        ensure_user_exists(&mut conn, user_id).await?;

        let orders = sqlx::query_as(&format!(
            "SELECT {} FROM vip_orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(orders)
    }

    /// Paid orders with no subscription record, oldest payment first
    pub async fn list_unfulfilled(&self, limit: i64) -> BillingResult<Vec<VipOrder>> {
        let orders = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM vip_orders o
            WHERE o.status = 'paid'
              AND NOT EXISTS (SELECT 1 FROM vip_records r WHERE r.order_id = o.id)
            ORDER BY o.paid_at ASC, o.id ASC
            LIMIT $1
            "#,
            ORDER_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }
}
