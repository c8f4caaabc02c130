//! Subscription invariants
//!
//! Read-only consistency checks over the ledger, the user projection and orders.
//! Run them after a sweep, a migration or an incident; each violation names the
//! users and orders involved and which operation repairs it.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use vipdesk_shared::{OrderId, OrderStatus, UserId};

use crate::error::BillingResult;

/// One failed check for one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<UserId>,
    pub order_ids: Vec<OrderId>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement or payment is wrong for a user
    Critical,
    /// Data disagreement that a repair path fixes
    High,
    /// Lazily discovered state that has not been swept yet
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: UserId,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectionMismatchRow {
    user_id: UserId,
    is_vip: bool,
    vip_end_at: Option<OffsetDateTime>,
    ledger_end_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleRecordRow {
    user_id: UserId,
    record_id: i64,
    end_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnfulfilledOrderRow {
    order_id: OrderId,
    user_id: UserId,
    order_no: String,
    paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidAtMismatchRow {
    order_id: OrderId,
    user_id: UserId,
    status: OrderStatus,
    paid_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_record().await?);
        violations.extend(self.check_projection_matches_ledger(now).await?);
        violations.extend(self.check_stale_active_records(now).await?);
        violations.extend(self.check_paid_orders_fulfilled().await?);
        violations.extend(self.check_order_paid_at_consistent().await?);

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);
        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Subscription invariant violations found"
            );
        }
        Ok(summary)
    }

    /// At most one active record per user
    async fn check_single_active_record(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS active_count
            FROM vip_records
            WHERE is_active
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_record".to_string(),
                user_ids: vec![row.user_id],
                order_ids: vec![],
                description: format!(
                    "User has {} active VIP records (expected at most 1)",
                    row.active_count
                ),
                context: serde_json::json!({ "active_count": row.active_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// `users.is_vip` agrees with the existence of an active unexpired record
    async fn check_projection_matches_ledger(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ProjectionMismatchRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.is_vip, u.vip_end_at, r.ledger_end_at
            FROM users u
            LEFT JOIN LATERAL (
                SELECT MAX(end_at) AS ledger_end_at
                FROM vip_records
                WHERE user_id = u.id AND is_active AND end_at > $1
            ) r ON TRUE
            WHERE u.is_vip <> (r.ledger_end_at IS NOT NULL)
               OR (u.is_vip AND u.vip_end_at IS DISTINCT FROM r.ledger_end_at)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "projection_matches_ledger".to_string(),
                user_ids: vec![row.user_id],
                order_ids: vec![],
                description: format!(
                    "Cached VIP flag is {} but the ledger says {}",
                    row.is_vip,
                    row.ledger_end_at.is_some()
                ),
                context: serde_json::json!({
                    "is_vip": row.is_vip,
                    "vip_end_at": row.vip_end_at.map(|t| t.to_string()),
                    "ledger_end_at": row.ledger_end_at.map(|t| t.to_string()),
                    "repair": "reconcile",
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Active records that have lapsed but were never flipped
    async fn check_stale_active_records(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleRecordRow> = sqlx::query_as(
            r#"
            SELECT user_id, id AS record_id, end_at
            FROM vip_records
            WHERE is_active AND end_at <= $1
            ORDER BY end_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_active_record".to_string(),
                user_ids: vec![row.user_id],
                order_ids: vec![],
                description: format!(
                    "VIP record {} expired at {} but is still active",
                    row.record_id, row.end_at
                ),
                context: serde_json::json!({
                    "record_id": row.record_id,
                    "end_at": row.end_at.to_string(),
                    "repair": "reconcile",
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Every paid order produced a record
    async fn check_paid_orders_fulfilled(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnfulfilledOrderRow> = sqlx::query_as(
            r#"
            SELECT o.id AS order_id, o.user_id, o.order_no, o.paid_at
            FROM vip_orders o
            WHERE o.status = 'paid'
              AND NOT EXISTS (SELECT 1 FROM vip_records r WHERE r.order_id = o.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_order_fulfilled".to_string(),
                user_ids: vec![row.user_id],
                order_ids: vec![row.order_id],
                description: format!("Paid order {} has no subscription record", row.order_no),
                context: serde_json::json!({
                    "order_no": row.order_no,
                    "paid_at": row.paid_at.map(|t| t.to_string()),
                    "repair": "confirm_order",
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// `paid_at` is set exactly when the order is paid
    async fn check_order_paid_at_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidAtMismatchRow> = sqlx::query_as(
            r#"
            SELECT id AS order_id, user_id, status, paid_at
            FROM vip_orders
            WHERE (status = 'paid') <> (paid_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "order_paid_at_consistent".to_string(),
                user_ids: vec![row.user_id],
                order_ids: vec![row.order_id],
                description: format!(
                    "Order is {} but paid_at is {}",
                    row.status,
                    if row.paid_at.is_some() { "set" } else { "missing" }
                ),
                context: serde_json::json!({
                    "status": row.status.to_string(),
                    "paid_at": row.paid_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let now = OffsetDateTime::now_utc();
        match name {
            "single_active_record" => self.check_single_active_record().await,
            "projection_matches_ledger" => self.check_projection_matches_ledger(now).await,
            "stale_active_record" => self.check_stale_active_records(now).await,
            "paid_order_fulfilled" => self.check_paid_orders_fulfilled().await,
            "order_paid_at_consistent" => self.check_order_paid_at_consistent().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_record",
            "projection_matches_ledger",
            "stale_active_record",
            "paid_order_fulfilled",
            "order_paid_at_consistent",
        ]
    }
}
