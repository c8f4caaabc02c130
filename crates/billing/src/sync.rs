//! Subscription sync
//!
//! Expiry is only ever discovered by [`SubscriptionLedger::reconcile`]. This module
//! exposes that as an explicit per-user action and as batch sweeps for the worker:
//! one over lapsed-but-active records and one over paid orders missing their record.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use vipdesk_shared::UserId;

use crate::error::BillingResult;
use crate::ledger::{ReconcileOutcome, SubscriptionLedger};
use crate::orders::OrderManager;

/// Per-batch tally; a failure for one user never aborts the batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    /// Users or orders actually changed
    pub repaired: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncService {
    pool: PgPool,
    ledger: SubscriptionLedger,
    orders: OrderManager,
}

impl SyncService {
    pub fn new(pool: PgPool, ledger: SubscriptionLedger, orders: OrderManager) -> Self {
        Self {
            pool,
            ledger,
            orders,
        }
    }

    /// Synchronize one user's VIP status now. Idempotent.
    pub async fn sync_subscription(&self, user_id: UserId) -> BillingResult<ReconcileOutcome> {
        self.ledger.reconcile(user_id).await
    }

    /// Reconcile up to `limit` users holding an active record that has lapsed
    pub async fn sweep_expired(&self, limit: i64) -> BillingResult<SweepReport> {
        let users: Vec<(UserId,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM vip_records
            WHERE is_active AND end_at <= $1
            GROUP BY user_id
            ORDER BY MIN(end_at) ASC
            LIMIT $2
            "#,
        )
        .bind(OffsetDateTime::now_utc())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut report = SweepReport {
            scanned: users.len(),
            ..SweepReport::default()
        };
        for (user_id,) in users {
            match self.ledger.reconcile(user_id).await {
                Ok(outcome) if outcome.changed() => report.repaired += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to reconcile expired VIP user"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired = report.repaired,
                failed = report.failed,
                "Expired VIP sweep finished"
            );
        }
        Ok(report)
    }

    /// Re-confirm up to `limit` paid orders that never produced a record
    pub async fn repair_unfulfilled_orders(&self, limit: i64) -> BillingResult<SweepReport> {
        let orders = self.orders.list_unfulfilled(limit).await?;

        let mut report = SweepReport {
            scanned: orders.len(),
            ..SweepReport::default()
        };
        for order in orders {
            match self.orders.confirm_order(order.id).await {
                Ok(_) => report.repaired += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        order_id = %order.id,
                        user_id = %order.user_id,
                        error = %e,
                        "Failed to repair paid VIP order"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                repaired = report.repaired,
                failed = report.failed,
                "Unfulfilled order sweep finished"
            );
        }
        Ok(report)
    }
}
