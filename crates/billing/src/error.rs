//! Billing error types

use thiserror::Error;
use vipdesk_shared::{OrderId, SharedError, UsageCategory};

/// PostgreSQL SQLSTATE codes the core reacts to
mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Usage limit reached for {category}: {used}/{max}")]
    QuotaExceeded {
        category: UsageCategory,
        used: i32,
        max: i32,
    },

    #[error("Concurrent modification detected: {0}")]
    Conflict(String),

    #[error("Order {order_id} is paid but has no subscription record: {reason}")]
    NeedsReconciliation { order_id: OrderId, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Conflict,
    Internal,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::InvalidState(_)
            | BillingError::QuotaExceeded { .. }
            | BillingError::InvalidInput(_) => ErrorKind::InvalidState,
            BillingError::Conflict(_) => ErrorKind::Conflict,
            BillingError::NeedsReconciliation { .. }
            | BillingError::Database(_)
            | BillingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-running the whole transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Conflict(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => BillingError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED) => {
                    BillingError::Conflict(db_err.message().to_string())
                }
                Some(sqlstate::UNIQUE_VIOLATION) => BillingError::Conflict(format!(
                    "Unique constraint {} violated",
                    db_err.constraint().unwrap_or("unknown")
                )),
                Some(sqlstate::FOREIGN_KEY_VIOLATION) => BillingError::InvalidState(format!(
                    "Row is still referenced ({})",
                    db_err.constraint().unwrap_or("unknown")
                )),
                _ => BillingError::Database(err.to_string()),
            },
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Validation(msg) => BillingError::InvalidInput(msg),
            SharedError::Calendar(msg) => BillingError::Internal(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
