//! Quota manager
//!
//! One `ai_usage` row per user holds a used/max pair for each [`UsageCategory`] and a
//! shared monthly `reset_at`. The tier applied to the row always comes from the ledger
//! (an active, unexpired record), never from the cached `users.is_vip` projection.
//!
//! Every access refreshes the row before anything else:
//! 1. `now >= reset_at`: counts go to zero, `reset_at` moves to the next month start,
//!    limits follow the current tier
//! 2. tier or configured limits changed: only the maxima move, counts are kept
//!
//! Increments lock the row, so check-then-increment never lets `used` pass `max`.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use vipdesk_shared::{next_month_start, MembershipTier, QuotaLimits, UsageCategory, UserId};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{ensure_user_exists, has_entitlement};
use crate::retry::{with_conflict_retry, RetryPolicy};

/// Monthly usage counters for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: UserId,
    pub tier: MembershipTier,
    pub chat_used: i32,
    pub chat_max: i32,
    pub content_used: i32,
    pub content_max: i32,
    pub analysis_used: i32,
    pub analysis_max: i32,
    pub reset_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// One category's counter as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub category: UsageCategory,
    pub used_count: i32,
    pub max_count: i32,
    pub remaining: i32,
}

/// What [`refresh`] did to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    Unchanged,
    Reset,
    TierAdjusted,
}

/// Full usage view for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub user_id: UserId,
    pub tier: MembershipTier,
    pub categories: Vec<UsageCounter>,
    pub reset_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

impl UsageRecord {
    pub fn used(&self, category: UsageCategory) -> i32 {
        match category {
            UsageCategory::Chat => self.chat_used,
            UsageCategory::Content => self.content_used,
            UsageCategory::Analysis => self.analysis_used,
        }
    }

    pub fn max(&self, category: UsageCategory) -> i32 {
        match category {
            UsageCategory::Chat => self.chat_max,
            UsageCategory::Content => self.content_max,
            UsageCategory::Analysis => self.analysis_max,
        }
    }

    fn used_mut(&mut self, category: UsageCategory) -> &mut i32 {
        match category {
            UsageCategory::Chat => &mut self.chat_used,
            UsageCategory::Content => &mut self.content_used,
            UsageCategory::Analysis => &mut self.analysis_used,
        }
    }

    pub fn counter(&self, category: UsageCategory) -> UsageCounter {
        let used_count = self.used(category);
        let max_count = self.max(category);
        UsageCounter {
            category,
            used_count,
            max_count,
            remaining: (max_count - used_count).max(0),
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            user_id: self.user_id,
            tier: self.tier,
            categories: UsageCategory::ALL.iter().map(|c| self.counter(*c)).collect(),
            reset_at: self.reset_at,
            last_used_at: self.last_used_at,
        }
    }

    fn limits_match(&self, tier: MembershipTier, limits: &QuotaLimits) -> bool {
        let wanted = limits.for_tier(tier);
        self.tier == tier
            && UsageCategory::ALL
                .iter()
                .all(|c| self.max(*c) == wanted.for_category(*c))
    }

    fn apply_limits(&mut self, tier: MembershipTier, limits: &QuotaLimits) {
        let wanted = limits.for_tier(tier);
        self.tier = tier;
        self.chat_max = wanted.chat;
        self.content_max = wanted.content;
        self.analysis_max = wanted.analysis;
    }
}

/// Bring a record up to date for `tier` at `now`. The reset always wins over a tier
/// adjustment so a request at the month boundary is judged against fresh counts.
pub fn refresh(
    record: &mut UsageRecord,
    tier: MembershipTier,
    limits: &QuotaLimits,
    now: OffsetDateTime,
) -> BillingResult<RefreshAction> {
    if now >= record.reset_at {
        record.chat_used = 0;
        record.content_used = 0;
        record.analysis_used = 0;
        record.reset_at = next_month_start(now)?;
        record.apply_limits(tier, limits);
        return Ok(RefreshAction::Reset);
    }

    if record.limits_match(tier, limits) {
        return Ok(RefreshAction::Unchanged);
    }

    record.apply_limits(tier, limits);
    Ok(RefreshAction::TierAdjusted)
}

/// Take one unit of `category`, or report the ceiling
pub fn try_consume(
    record: &mut UsageRecord,
    category: UsageCategory,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let used = record.used(category);
    let max = record.max(category);
    if used >= max {
        return Err(BillingError::QuotaExceeded { category, used, max });
    }
    *record.used_mut(category) = used + 1;
    record.last_used_at = Some(now);
    Ok(())
}

const USAGE_COLUMNS: &str = "id, user_id, tier, chat_used, chat_max, content_used, content_max, \
    analysis_used, analysis_max, reset_at, last_used_at, created_at, updated_at";

async fn persist(conn: &mut PgConnection, record: &UsageRecord) -> BillingResult<UsageRecord> {
    let saved = sqlx::query_as(&format!(
        r#"
        UPDATE ai_usage
        SET tier = $2,
            chat_used = $3, chat_max = $4,
            content_used = $5, content_max = $6,
            analysis_used = $7, analysis_max = $8,
            reset_at = $9, last_used_at = $10, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        USAGE_COLUMNS
    ))
    .bind(record.id)
    .bind(record.tier)
    .bind(record.chat_used)
    .bind(record.chat_max)
    .bind(record.content_used)
    .bind(record.content_max)
    .bind(record.analysis_used)
    .bind(record.analysis_max)
    .bind(record.reset_at)
    .bind(record.last_used_at)
    .fetch_one(conn)
    .await?;
    Ok(saved)
}

#[derive(Clone)]
pub struct QuotaManager {
    pool: PgPool,
    limits: QuotaLimits,
    retry: RetryPolicy,
}

impl QuotaManager {
    pub fn new(pool: PgPool, limits: QuotaLimits, retry: RetryPolicy) -> Self {
        Self {
            pool,
            limits,
            retry,
        }
    }

    /// Create or lock the user's row and refresh it. Changes are written but not committed.
    async fn load_locked(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<UsageRecord> {
        ensure_user_exists(&mut *conn, user_id).await?;
        let entitled = has_entitlement(&mut *conn, user_id, now).await?;
        let tier = MembershipTier::from_entitlement(entitled);
        let initial = self.limits.for_tier(tier);

        let created = sqlx::query(
            r#"
            INSERT INTO ai_usage (user_id, tier, chat_max, content_max, analysis_max, reset_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(tier)
        .bind(initial.chat)
        .bind(initial.content)
        .bind(initial.analysis)
        .bind(next_month_start(now)?)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if created > 0 {
            tracing::debug!(user_id = %user_id, tier = %tier, "Usage counters created");
        }

        let mut record: UsageRecord = sqlx::query_as(&format!(
            "SELECT {} FROM ai_usage WHERE user_id = $1 FOR UPDATE",
            USAGE_COLUMNS
        ))
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

        let previous_tier = record.tier;
        match refresh(&mut record, tier, &self.limits, now)? {
            RefreshAction::Unchanged => Ok(record),
            RefreshAction::Reset => {
                tracing::info!(
                    user_id = %user_id,
                    tier = %tier,
                    next_reset_at = %record.reset_at,
                    "Usage counters reset for new period"
                );
                persist(conn, &record).await
            }
            RefreshAction::TierAdjusted => {
                tracing::info!(
                    user_id = %user_id,
                    from = %previous_tier,
                    to = %tier,
                    "Usage limits adjusted to current tier"
                );
                persist(conn, &record).await
            }
        }
    }

    /// The user's counters, created on first access and refreshed on every access
    pub async fn get_or_create(&self, user_id: UserId) -> BillingResult<UsageRecord> {
        with_conflict_retry(&self.retry, "quota.get_or_create", || async {
            let mut tx = self.pool.begin().await?;
            let record = self.load_locked(&mut tx, user_id, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    /// Consume one unit of `category`.
    ///
    /// At the ceiling this returns [`BillingError::QuotaExceeded`]; any reset or tier
    /// adjustment made while evaluating the request is still committed.
    pub async fn increment(
        &self,
        user_id: UserId,
        category: UsageCategory,
    ) -> BillingResult<UsageRecord> {
        with_conflict_retry(&self.retry, "quota.increment", || async {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut record = self.load_locked(&mut tx, user_id, now).await?;

            if let Err(err) = try_consume(&mut record, category, now) {
                tx.commit().await?;
                tracing::info!(
                    user_id = %user_id,
                    category = %category,
                    used = record.used(category),
                    max = record.max(category),
                    "Usage limit reached"
                );
                return Err(err);
            }

            let saved = persist(&mut tx, &record).await?;
            tx.commit().await?;

            tracing::debug!(
                user_id = %user_id,
                category = %category,
                used = saved.used(category),
                max = saved.max(category),
                "Usage recorded"
            );
            Ok(saved)
        })
        .await
    }

    /// All three counters plus tier and reset time
    pub async fn get_usage(&self, user_id: UserId) -> BillingResult<UsageSnapshot> {
        Ok(self.get_or_create(user_id).await?.snapshot())
    }
}
