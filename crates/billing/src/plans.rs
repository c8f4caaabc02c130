//! Plan catalog
//!
//! Read-mostly set of purchasable VIP plans. Orders copy a plan's price at creation
//! time and activation reads its duration, so a plan cannot be deleted while any
//! order or ledger record references it.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use vipdesk_shared::PlanId;

use crate::error::{BillingError, BillingResult};

/// Catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VipPlan {
    pub id: PlanId,
    pub name: String,
    pub price_cents: i64,
    pub duration_days: i32,
    pub features: Json<Vec<String>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Longest plan the catalog accepts (about a century)
pub const MAX_PLAN_DURATION_DAYS: i32 = 36_500;

impl VipPlan {
    pub fn duration(&self) -> time::Duration {
        time::Duration::days(i64::from(self.duration_days))
    }

    /// End of a subscription to this plan starting at `start_at`
    pub fn end_from(&self, start_at: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        start_at.checked_add(self.duration()).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Plan {} duration of {} days is out of range",
                self.id, self.duration_days
            ))
        })
    }
}

/// Request to add a plan to the catalog
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub price_cents: i64,
    pub duration_days: i32,
    #[serde(default)]
    pub features: Vec<String>,
}

impl NewPlan {
    pub fn validate(&self) -> BillingResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(BillingError::InvalidInput("Plan name is required".to_string()));
        }
        if name.chars().count() > 50 {
            return Err(BillingError::InvalidInput(
                "Plan name must be at most 50 characters".to_string(),
            ));
        }
        if self.price_cents < 0 {
            return Err(BillingError::InvalidInput(
                "Plan price cannot be negative".to_string(),
            ));
        }
        if self.duration_days <= 0 {
            return Err(BillingError::InvalidInput(
                "Plan duration must be at least one day".to_string(),
            ));
        }
        if self.duration_days > MAX_PLAN_DURATION_DAYS {
            return Err(BillingError::InvalidInput(format!(
                "Plan duration must be at most {} days",
                MAX_PLAN_DURATION_DAYS
            )));
        }
        Ok(())
    }
}

/// Monthly, quarterly and yearly plans installed into an empty catalog
pub fn default_plans() -> Vec<NewPlan> {
    let features = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        NewPlan {
            name: "Monthly VIP".to_string(),
            price_cents: 1990,
            duration_days: 30,
            features: features(&[
                "Ad-free experience",
                "Priority support",
                "10GB monthly storage",
                "Advanced features",
            ]),
        },
        NewPlan {
            name: "Quarterly VIP".to_string(),
            price_cents: 4990,
            duration_days: 90,
            features: features(&[
                "Ad-free experience",
                "Priority support",
                "20GB monthly storage",
                "Advanced features",
                "Member badge",
            ]),
        },
        NewPlan {
            name: "Yearly VIP".to_string(),
            price_cents: 14990,
            duration_days: 365,
            features: features(&[
                "Ad-free experience",
                "Priority support",
                "50GB monthly storage",
                "Advanced features",
                "Member badge",
                "Member-only events",
                "Early access to new features",
            ]),
        },
    ]
}

const PLAN_COLUMNS: &str = "id, name, price_cents, duration_days, features, created_at, updated_at";

/// Load a plan inside an open transaction
pub(crate) async fn fetch_plan(conn: &mut PgConnection, plan_id: PlanId) -> BillingResult<VipPlan> {
    let plan: Option<VipPlan> =
        sqlx::query_as(&format!("SELECT {} FROM vip_plans WHERE id = $1", PLAN_COLUMNS))
            .bind(plan_id)
            .fetch_optional(conn)
            .await?;
    plan.ok_or_else(|| BillingError::NotFound(format!("VIP plan {} not found", plan_id)))
}

#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_plans(&self) -> BillingResult<Vec<VipPlan>> {
        let plans = sqlx::query_as(&format!(
            "SELECT {} FROM vip_plans ORDER BY price_cents ASC, id ASC",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> BillingResult<VipPlan> {
        let mut conn = self.pool.acquire().await?;
        fetch_plan(&mut conn, plan_id).await
    }

    pub async fn create_plan(&self, new_plan: NewPlan) -> BillingResult<VipPlan> {
        new_plan.validate()?;

        let plan: VipPlan = sqlx::query_as(&format!(
            r#"
            INSERT INTO vip_plans (name, price_cents, duration_days, features)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            PLAN_COLUMNS
        ))
        .bind(new_plan.name.trim())
        .bind(new_plan.price_cents)
        .bind(new_plan.duration_days)
        .bind(Json(new_plan.features.clone()))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            name = %plan.name,
            price_cents = plan.price_cents,
            duration_days = plan.duration_days,
            "VIP plan created"
        );

        Ok(plan)
    }

    /// Remove a plan nobody has bought or been granted
    pub async fn delete_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(PlanId,)> =
            sqlx::query_as("SELECT id FROM vip_plans WHERE id = $1 FOR UPDATE")
                .bind(plan_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(BillingError::NotFound(format!("VIP plan {} not found", plan_id)));
        }

        let (referenced,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (SELECT 1 FROM vip_orders WHERE plan_id = $1)
                OR EXISTS (SELECT 1 FROM vip_records WHERE plan_id = $1)
            "#,
        )
        .bind(plan_id)
        .fetch_one(&mut *tx)
        .await?;

        if referenced {
            return Err(BillingError::InvalidState(format!(
                "VIP plan {} is referenced by orders or subscription records",
                plan_id
            )));
        }

        sqlx::query("DELETE FROM vip_plans WHERE id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(plan_id = %plan_id, "VIP plan deleted");
        Ok(())
    }

    /// Install the default catalog if no plans exist. Returns how many were created.
    pub async fn seed_default_plans(&self) -> BillingResult<usize> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent seeders so the catalog is installed once
        sqlx::query("LOCK TABLE vip_plans IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vip_plans")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            tracing::debug!(existing = count, "VIP catalog already populated, skipping seed");
            return Ok(0);
        }

        let plans = default_plans();
        for plan in &plans {
            sqlx::query(
                r#"
                INSERT INTO vip_plans (name, price_cents, duration_days, features)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&plan.name)
            .bind(plan.price_cents)
            .bind(plan.duration_days)
            .bind(Json(plan.features.clone()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(created = plans.len(), "Seeded default VIP plans");
        Ok(plans.len())
    }
}
