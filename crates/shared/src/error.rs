//! Error types shared across vipdesk crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid date arithmetic: {0}")]
    Calendar(String),
}
