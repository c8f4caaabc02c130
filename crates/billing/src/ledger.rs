//! Subscription ledger
//!
//! `vip_records` is an append-only ledger of granted subscription periods and the
//! source of truth for entitlement. The VIP fields on `users` are a projection of it
//! and are written only from this module.
//!
//! Every mutation runs in one transaction that first locks the user's row, so two
//! writers for the same user serialize while different users never contend. The
//! deactivate-then-insert order makes [`SubscriptionLedger::activate`] safe to re-run.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use vipdesk_shared::{OrderId, PlanId, RecordId, UserId};

use crate::entitlement::{plan_reconciliation, EntitlementState, Projection, ReconcilePlan};
use crate::error::{BillingError, BillingResult};
use crate::plans::fetch_plan;
use crate::retry::{with_conflict_retry, RetryPolicy};

/// One granted subscription period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VipRecord {
    pub id: RecordId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    /// Order that produced this record; `None` for direct grants
    pub order_id: Option<OrderId>,
    pub is_active: bool,
    pub start_at: OffsetDateTime,
    pub end_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// The record currently entitling a user, joined with its plan name
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActiveSubscription {
    pub record_id: RecordId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub order_id: Option<OrderId>,
    pub start_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Result of reconciling one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub user_id: UserId,
    pub state: EntitlementState,
    pub is_vip: bool,
    pub expires_at: Option<OffsetDateTime>,
    /// Records flipped inactive because they lapsed
    pub expired_records: usize,
    /// Records flipped inactive because another active record outlasts them
    pub superseded_records: usize,
    pub projection_updated: bool,
}

impl ReconcileOutcome {
    fn from_plan(user_id: UserId, plan: &ReconcilePlan) -> Self {
        Self {
            user_id,
            state: plan.state,
            is_vip: plan.target.is_vip,
            expires_at: plan.expires_at(),
            expired_records: plan.expired.len(),
            superseded_records: plan.superseded.len(),
            projection_updated: plan.projection_changed,
        }
    }

    /// True when reconciliation wrote anything
    pub fn changed(&self) -> bool {
        self.projection_updated || self.expired_records > 0 || self.superseded_records > 0
    }
}

pub(crate) const RECORD_COLUMNS: &str =
    "id, user_id, plan_id, order_id, is_active, start_at, end_at, created_at, updated_at";

/// Lock the user's row for the rest of the transaction and read its projection
pub(crate) async fn lock_user(
    conn: &mut PgConnection,
    user_id: UserId,
) -> BillingResult<Projection> {
    let projection: Option<Projection> = sqlx::query_as(
        "SELECT is_vip, vip_start_at, vip_end_at FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    projection.ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
}

pub(crate) async fn ensure_user_exists(
    conn: &mut PgConnection,
    user_id: UserId,
) -> BillingResult<()> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
        .bind(user_id)
        .fetch_one(conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(BillingError::NotFound(format!("User {} not found", user_id)))
    }
}

/// Read-only entitlement check usable inside another transaction
pub(crate) async fn has_entitlement(
    conn: &mut PgConnection,
    user_id: UserId,
    now: OffsetDateTime,
) -> BillingResult<bool> {
    let (entitled,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM vip_records
            WHERE user_id = $1 AND is_active AND end_at > $2
        )
        "#,
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(entitled)
}

async fn write_projection(
    conn: &mut PgConnection,
    user_id: UserId,
    projection: &Projection,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET is_vip = $2, vip_start_at = $3, vip_end_at = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(projection.is_vip)
    .bind(projection.vip_start_at)
    .bind(projection.vip_end_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Activate a subscription inside the caller's transaction.
///
/// Supersedes every existing record, inserts the new active one and points the
/// projection at it. Callers commit; order confirmation relies on this to commit the
/// order's paid transition and the grant together.
pub(crate) async fn activate_in(
    conn: &mut PgConnection,
    user_id: UserId,
    plan_id: PlanId,
    order_id: Option<OrderId>,
    start_at: OffsetDateTime,
    end_at: OffsetDateTime,
) -> BillingResult<VipRecord> {
    if end_at < start_at {
        return Err(BillingError::InvalidInput(format!(
            "Subscription end {} is before its start {}",
            end_at, start_at
        )));
    }

    lock_user(&mut *conn, user_id).await?;
    fetch_plan(&mut *conn, plan_id).await?;

    let superseded = sqlx::query(
        r#"
        UPDATE vip_records
        SET is_active = FALSE, updated_at = NOW()
        WHERE user_id = $1 AND is_active
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let record: VipRecord = sqlx::query_as(&format!(
        r#"
        INSERT INTO vip_records (user_id, plan_id, order_id, is_active, start_at, end_at)
        VALUES ($1, $2, $3, TRUE, $4, $5)
        RETURNING {}
        "#,
        RECORD_COLUMNS
    ))
    .bind(user_id)
    .bind(plan_id)
    .bind(order_id)
    .bind(start_at)
    .bind(end_at)
    .fetch_one(&mut *conn)
    .await?;

    write_projection(&mut *conn, user_id, &Projection::from_record(&record)).await?;

    tracing::info!(
        user_id = %user_id,
        plan_id = %plan_id,
        record_id = %record.id,
        order_id = ?order_id,
        superseded,
        end_at = %record.end_at,
        "VIP subscription activated"
    );

    Ok(record)
}

/// Owner of the ledger/projection invariant
#[derive(Clone)]
pub struct SubscriptionLedger {
    pool: PgPool,
    retry: RetryPolicy,
}

impl SubscriptionLedger {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Grant `plan_id` to `user_id` for `[start_at, end_at)`, superseding any prior record
    pub async fn activate(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        start_at: OffsetDateTime,
        end_at: OffsetDateTime,
    ) -> BillingResult<VipRecord> {
        with_conflict_retry(&self.retry, "ledger.activate", || async {
            let mut tx = self.pool.begin().await?;
            let record = activate_in(&mut tx, user_id, plan_id, None, start_at, end_at).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    /// Administrative grant of a plan starting now for the plan's duration
    pub async fn grant(&self, user_id: UserId, plan_id: PlanId) -> BillingResult<VipRecord> {
        with_conflict_retry(&self.retry, "ledger.grant", || async {
            let mut tx = self.pool.begin().await?;
            let plan = fetch_plan(&mut tx, plan_id).await?;
            let start_at = OffsetDateTime::now_utc();
            let end_at = plan.end_from(start_at)?;
            let record = activate_in(&mut tx, user_id, plan_id, None, start_at, end_at).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    /// Revoke entitlement: every record goes inactive and the projection is cleared.
    /// Returns how many records were deactivated.
    pub async fn deactivate(&self, user_id: UserId) -> BillingResult<u64> {
        with_conflict_retry(&self.retry, "ledger.deactivate", || async {
            let mut tx = self.pool.begin().await?;
            lock_user(&mut tx, user_id).await?;

            let deactivated = sqlx::query(
                r#"
                UPDATE vip_records
                SET is_active = FALSE, updated_at = NOW()
                WHERE user_id = $1 AND is_active
                "#,
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            write_projection(&mut tx, user_id, &Projection::none()).await?;
            tx.commit().await?;

            tracing::info!(user_id = %user_id, deactivated, "VIP subscription deactivated");
            Ok(deactivated)
        })
        .await
    }

    /// Recompute the projection from the ledger and repair drift.
    ///
    /// Idempotent: a second call with no intervening writes changes nothing and
    /// returns the same `(is_vip, expires_at)`.
    pub async fn reconcile(&self, user_id: UserId) -> BillingResult<ReconcileOutcome> {
        with_conflict_retry(&self.retry, "ledger.reconcile", || async {
            let mut tx = self.pool.begin().await?;
            let projection = lock_user(&mut tx, user_id).await?;
            let now = OffsetDateTime::now_utc();

            let active: Vec<VipRecord> = sqlx::query_as(&format!(
                "SELECT {} FROM vip_records WHERE user_id = $1 AND is_active",
                RECORD_COLUMNS
            ))
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;

            let plan = plan_reconciliation(&active, &projection, now);
            if plan.is_noop() {
                tx.commit().await?;
                return Ok(ReconcileOutcome::from_plan(user_id, &plan));
            }

            let deactivate: Vec<i64> = plan.deactivations().iter().map(|id| id.0).collect();
            if !deactivate.is_empty() {
                sqlx::query(
                    r#"
                    UPDATE vip_records
                    SET is_active = FALSE, updated_at = NOW()
                    WHERE id = ANY($1)
                    "#,
                )
                .bind(&deactivate)
                .execute(&mut *tx)
                .await?;
            }
            if plan.projection_changed {
                write_projection(&mut tx, user_id, &plan.target).await?;
            }
            tx.commit().await?;

            if !plan.expired.is_empty() {
                tracing::info!(
                    user_id = %user_id,
                    expired = plan.expired.len(),
                    still_vip = plan.target.is_vip,
                    "Discovered expired VIP records"
                );
            }
            if !plan.superseded.is_empty() {
                tracing::warn!(
                    user_id = %user_id,
                    superseded = plan.superseded.len(),
                    "Repaired multiple active VIP records"
                );
            }
            tracing::debug!(user_id = %user_id, state = %plan.state, "VIP projection reconciled");

            Ok(ReconcileOutcome::from_plan(user_id, &plan))
        })
        .await
    }

    /// Read-only fast path: is there an active, unexpired record? Does not repair drift.
    pub async fn check_entitlement(&self, user_id: UserId) -> BillingResult<bool> {
        let mut conn = self.pool.acquire().await?;
        ensure_user_exists(&mut conn, user_id).await?;
        has_entitlement(&mut conn, user_id, OffsetDateTime::now_utc()).await
    }

    /// The record entitling the user right now, if any
    pub async fn active_subscription(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<ActiveSubscription>> {
        let mut conn = self.pool.acquire().await?;
        ensure_user_exists(&mut conn, user_id).await?;

        let active: Option<ActiveSubscription> = sqlx::query_as(
            r#"
            SELECT
                r.id AS record_id,
                r.user_id,
                r.plan_id,
                p.name AS plan_name,
                r.order_id,
                r.start_at,
                r.end_at AS expires_at
            FROM vip_records r
            JOIN vip_plans p ON p.id = r.plan_id
            WHERE r.user_id = $1 AND r.is_active AND r.end_at > $2
            ORDER BY r.end_at DESC, r.id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(active)
    }

    /// Subscription history, newest first
    pub async fn list_records(&self, user_id: UserId) -> BillingResult<Vec<VipRecord>> {
        let mut conn = self.pool.acquire().await?;
        ensure_user_exists(&mut conn, user_id).await?;

        let records = sqlx::query_as(&format!(
            "SELECT {} FROM vip_records WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }
}
