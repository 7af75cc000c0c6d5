use axum::{
    routing::{get, post, put},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/plans", get(api::list_plans))
        .route(
            "/api/billing/orgs/:org_id/entitlements/check",
            post(api::check_entitlement),
        )
        .route(
            "/api/billing/orgs/:org_id/usage",
            get(api::usage_summary).post(api::record_usage),
        )
        .route(
            "/api/billing/orgs/:org_id/billing-summary",
            get(api::billing_summary),
        )
        .route(
            "/api/billing/orgs/:org_id/plan/upgrade",
            post(api::upgrade_plan),
        )
        .route(
            "/api/billing/orgs/:org_id/plan/downgrade",
            post(api::downgrade_plan),
        )
        .route(
            "/api/billing/orgs/:org_id/limits/:resource",
            put(api::set_limit_override),
        )
        .route("/api/billing/orgs/:org_id/alerts", get(api::alert_history))
        .route(
            "/api/billing/orgs/:org_id/alerts/stats",
            get(api::alert_stats),
        )
        .route("/api/billing/usage/reset", post(api::reset_usage))
}
