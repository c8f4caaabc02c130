// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! vipdesk Billing Core
//!
//! VIP subscriptions, purchase orders and monthly AI usage quotas on PostgreSQL.
//!
//! ## Features
//!
//! - **Plan Catalog**: Purchasable plans with price and duration
//! - **Subscription Ledger**: Append-only subscription periods with a reconciled
//!   `users.is_vip` projection
//! - **Orders**: Pending/paid/cancelled purchase orders; confirmation activates the
//!   subscription atomically
//! - **Quotas**: Per-category monthly counters with tiered limits
//! - **Sync**: On-demand and batch reconciliation of expired subscriptions
//! - **Invariants**: Read-only consistency checks

pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod orders;
pub mod plans;
pub mod quota;
pub mod retry;
pub mod sync;

use sqlx::PgPool;
use vipdesk_shared::QuotaLimits;

// Re-export error types
pub use error::{BillingError, BillingResult, ErrorKind};

// Re-export entitlement types
pub use entitlement::{plan_reconciliation, EntitlementState, Projection, ReconcilePlan};

// Re-export invariant types
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Re-export ledger types
pub use ledger::{ActiveSubscription, ReconcileOutcome, SubscriptionLedger, VipRecord};

// Re-export order types
pub use orders::{generate_order_no, ConfirmedOrder, OrderManager, VipOrder};

// Re-export plan types
pub use plans::{default_plans, NewPlan, PlanCatalog, VipPlan};

// Re-export quota types
pub use quota::{QuotaManager, RefreshAction, UsageCounter, UsageRecord, UsageSnapshot};

pub use retry::RetryPolicy;
pub use sync::{SweepReport, SyncService};

/// Tunables shared by every billing service
#[derive(Debug, Clone, Copy, Default)]
pub struct BillingConfig {
    pub limits: QuotaLimits,
    pub retry: RetryPolicy,
}

/// All billing services over one pool
#[derive(Clone)]
pub struct BillingServices {
    pub plans: PlanCatalog,
    pub ledger: SubscriptionLedger,
    pub orders: OrderManager,
    pub quota: QuotaManager,
    pub sync: SyncService,
    pub invariants: InvariantChecker,
}

impl BillingServices {
    pub fn new(pool: PgPool, config: BillingConfig) -> Self {
        let ledger = SubscriptionLedger::new(pool.clone(), config.retry);
        let orders = OrderManager::new(pool.clone(), config.retry);
        Self {
            plans: PlanCatalog::new(pool.clone()),
            quota: QuotaManager::new(pool.clone(), config.limits, config.retry),
            sync: SyncService::new(pool.clone(), ledger.clone(), orders.clone()),
            invariants: InvariantChecker::new(pool),
            ledger,
            orders,
        }
    }
}
