//! Entitlement Module
//!
//! Computes what a user's cached VIP projection *should* be from the ledger rows.
//! The ledger (`vip_records`) is the source of truth; `users.is_vip`,
//! `users.vip_start_at` and `users.vip_end_at` are a materialized projection of it.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: `plan_reconciliation()` is THE function that decides
//!    the projection, and the only place expiry is discovered
//! 2. **Deterministic**: the result depends on the active records and `now`, never on
//!    the projection's previous value
//! 3. **Testable**: pure function with clear inputs/outputs; the ledger applies the plan

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use vipdesk_shared::RecordId;

use crate::ledger::VipRecord;

/// Entitlement answer for one user at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// An active record covers `now`
    Active,
    /// Records are still flagged active but every one of them has lapsed
    ExpiredUnflagged,
    /// No active record
    Inactive,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::ExpiredUnflagged => write!(f, "expired_unflagged"),
            EntitlementState::Inactive => write!(f, "inactive"),
        }
    }
}

/// The cached VIP fields on `users`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Projection {
    pub is_vip: bool,
    pub vip_start_at: Option<OffsetDateTime>,
    pub vip_end_at: Option<OffsetDateTime>,
}

impl Projection {
    pub fn none() -> Self {
        Self {
            is_vip: false,
            vip_start_at: None,
            vip_end_at: None,
        }
    }

    pub fn from_record(record: &VipRecord) -> Self {
        Self {
            is_vip: true,
            vip_start_at: Some(record.start_at),
            vip_end_at: Some(record.end_at),
        }
    }
}

/// Writes needed to bring one user's ledger and projection into agreement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub state: EntitlementState,
    /// The record that entitles the user, if any
    pub current: Option<RecordId>,
    /// Active records whose `end_at` has passed
    pub expired: Vec<RecordId>,
    /// Unexpired active records that lost to `current` (only after invariant drift)
    pub superseded: Vec<RecordId>,
    pub target: Projection,
    pub projection_changed: bool,
}

impl ReconcilePlan {
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.target.vip_end_at
    }

    pub fn deactivations(&self) -> Vec<RecordId> {
        self.expired
            .iter()
            .chain(self.superseded.iter())
            .copied()
            .collect()
    }

    /// True when applying the plan writes nothing
    pub fn is_noop(&self) -> bool {
        self.expired.is_empty() && self.superseded.is_empty() && !self.projection_changed
    }
}

/// Pure function: decide the reconciled state from the user's active records
///
/// Inactive records in `records` are ignored. Among active records that have not
/// lapsed, the one ending last wins (ties broken by the newest id); every other
/// active record is scheduled for deactivation.
pub fn plan_reconciliation(
    records: &[VipRecord],
    projection: &Projection,
    now: OffsetDateTime,
) -> ReconcilePlan {
    let active: Vec<&VipRecord> = records.iter().filter(|r| r.is_active).collect();

    let current = active
        .iter()
        .filter(|r| r.end_at > now)
        .max_by_key(|r| (r.end_at, r.id))
        .copied();

    let expired: Vec<RecordId> = active
        .iter()
        .filter(|r| r.end_at <= now)
        .map(|r| r.id)
        .collect();

    let superseded: Vec<RecordId> = active
        .iter()
        .filter(|r| r.end_at > now && Some(r.id) != current.map(|c| c.id))
        .map(|r| r.id)
        .collect();

    let state = match (current, expired.is_empty()) {
        (Some(_), _) => EntitlementState::Active,
        (None, false) => EntitlementState::ExpiredUnflagged,
        (None, true) => EntitlementState::Inactive,
    };

    let target = current.map(Projection::from_record).unwrap_or_else(Projection::none);

    ReconcilePlan {
        state,
        current: current.map(|r| r.id),
        expired,
        superseded,
        projection_changed: target != *projection,
        target,
    }
}
