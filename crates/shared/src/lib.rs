//! vipdesk shared types and utilities
//!
//! Domain value types, storage lifecycle helpers and errors used by the billing core,
//! the HTTP tier and the worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
