//! API routes

pub mod admin;
pub mod health;
pub mod orders;
pub mod plans;
pub mod subscriptions;
pub mod usage;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use time::OffsetDateTime;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{config::Config, state::AppState};

/// Helper to format datetime as RFC3339
pub(crate) fn format_datetime(dt: OffsetDateTime) -> String {
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| dt.to_string())
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if config.cors_allowed_origins.iter().any(|s| s == "*") {
        return cors.allow_origin(Any);
    }

    let origins = config
        .cors_allowed_origins
        .iter()
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    cors.allow_origin(AllowOrigin::list(origins))
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_v1_routes = Router::new()
        // Plan catalog
        .route("/plans", get(plans::list_plans).post(plans::create_plan))
        .route("/plans/:plan_id", get(plans::get_plan).delete(plans::delete_plan))
        // Orders
        .route("/orders", post(orders::create_order))
        .route("/orders/by-no/:order_no", get(orders::get_order_by_no))
        .route("/orders/:order_id", get(orders::get_order))
        .route("/orders/:order_id/confirm", post(orders::confirm_order))
        .route("/orders/:order_id/cancel", post(orders::cancel_order))
        .route("/users/:user_id/orders", get(orders::list_user_orders))
        // Subscriptions
        .route(
            "/users/:user_id/subscription",
            get(subscriptions::get_subscription).delete(subscriptions::deactivate_subscription),
        )
        .route("/users/:user_id/subscription/sync", post(subscriptions::sync_subscription))
        .route("/users/:user_id/subscription/grant", post(subscriptions::grant_subscription))
        .route("/users/:user_id/subscription/history", get(subscriptions::subscription_history))
        .route("/users/:user_id/entitlement", get(subscriptions::check_entitlement))
        // Usage quotas
        .route("/users/:user_id/usage", get(usage::get_usage))
        .route("/users/:user_id/usage/:category", post(usage::increment_usage))
        // Operator diagnostics
        .route("/admin/invariants", get(admin::check_invariants));

    let cors = build_cors_layer(&state.config);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
