//! Database-backed integration tests for the billing core
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/vipdesk_test"
//! cargo test -p vipdesk-billing --test integration -- --ignored
//! ```
//!
//! Every test creates its own users and plans and removes them afterwards, so the
//! suite can run in parallel against a shared database.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod ledger;
mod orders;
mod quota;
mod sync;
