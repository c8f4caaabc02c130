//! Worker configuration

use std::env;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Six-field cron expression (with seconds)
    pub sweep_cron: String,
    /// Users and orders handled per sweep run
    pub sweep_batch: i64,
    pub db_conflict_retries: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        let sweep_batch: i64 = parse_var("SYNC_SWEEP_BATCH", 200)?;
        if sweep_batch <= 0 {
            return Err(WorkerConfigError::Invalid(
                "SYNC_SWEEP_BATCH",
                sweep_batch.to_string(),
            ));
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| WorkerConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 2)?,
            sweep_cron: env::var("SYNC_SWEEP_CRON").unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            sweep_batch,
            db_conflict_retries: parse_var("DB_CONFLICT_RETRIES", 3)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, WorkerConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| WorkerConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
