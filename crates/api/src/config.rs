//! Application configuration

use std::env;
use std::str::FromStr;

use vipdesk_shared::{QuotaLimits, TierLimits};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub db_conflict_retries: usize,

    // Catalog
    pub seed_default_plans: bool,

    // Quotas
    pub quota_limits: QuotaLimits,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = QuotaLimits::default();
        let quota_limits = QuotaLimits {
            standard: TierLimits {
                chat: parse_var("QUOTA_STANDARD_CHAT", defaults.standard.chat)?,
                content: parse_var("QUOTA_STANDARD_CONTENT", defaults.standard.content)?,
                analysis: parse_var("QUOTA_STANDARD_ANALYSIS", defaults.standard.analysis)?,
            },
            vip: TierLimits {
                chat: parse_var("QUOTA_VIP_CHAT", defaults.vip.chat)?,
                content: parse_var("QUOTA_VIP_CONTENT", defaults.vip.content)?,
                analysis: parse_var("QUOTA_VIP_ANALYSIS", defaults.vip.analysis)?,
            },
        };
        quota_limits
            .validate()
            .map_err(|e| ConfigError::InvalidQuota(e.to_string()))?;

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            run_migrations: parse_var("RUN_MIGRATIONS", true)?,
            db_conflict_retries: parse_var("DB_CONFLICT_RETRIES", 3)?,

            // Catalog
            seed_default_plans: parse_var("SEED_DEFAULT_PLANS", true)?,

            quota_limits,
        })
    }
}

/// Read `name`, falling back to `default` when unset; a set but malformed value is an error
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
    #[error("Invalid quota limits: {0}")]
    InvalidQuota(String),
}
