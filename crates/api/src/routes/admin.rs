//! Operator routes

use axum::{extract::State, Json};
use vipdesk_billing::InvariantCheckSummary;

use crate::{error::ApiResult, state::AppState};

/// Run every subscription invariant check
pub async fn check_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
