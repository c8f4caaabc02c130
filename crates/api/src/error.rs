//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vipdesk_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Conflict: {0}")]
    Conflict(String),

    // Billing errors
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Needs reconciliation: {0}")]
    NeedsReconciliation(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::InvalidState(msg) => (StatusCode::CONFLICT, "INVALID_STATE", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::QuotaExceeded(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "QUOTA_EXCEEDED", msg.clone())
            }
            ApiError::NeedsReconciliation(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "NEEDS_RECONCILIATION",
                msg.clone(),
            ),

            // Internal
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidState(msg) => ApiError::InvalidState(msg),
            e @ BillingError::QuotaExceeded { .. } => ApiError::QuotaExceeded(e.to_string()),
            BillingError::Conflict(msg) => ApiError::Conflict(msg),
            e @ BillingError::NeedsReconciliation { .. } => {
                tracing::error!(error = %e, "Order needs reconciliation");
                ApiError::NeedsReconciliation(e.to_string())
            }
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                ApiError::Database(msg)
            }
            BillingError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::from(err).into()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
