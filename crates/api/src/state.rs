//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use vipdesk_billing::{BillingConfig, BillingServices, RetryPolicy};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingServices>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = BillingServices::new(
            pool.clone(),
            BillingConfig {
                limits: config.quota_limits,
                retry: RetryPolicy::with_retries(config.db_conflict_retries),
            },
        );
        Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
        }
    }
}
