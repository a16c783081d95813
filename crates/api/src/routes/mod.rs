//! Route registration

pub mod billing;
pub mod usage;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Billing operations
        .route("/api/billing/plans", get(billing::list_plans))
        .route("/api/billing/subscription", get(billing::subscription_summary))
        .route("/api/billing/auto-renew", post(billing::set_auto_renew))
        .route("/api/billing/plan", post(billing::change_plan))
        .route("/api/billing/payment-method", post(billing::payment_method))
        .route("/api/billing/invariants", get(billing::run_invariants))
        // Metered usage
        .route(
            "/api/usage/transcription",
            get(usage::check_transcription).post(usage::record_transcription),
        )
        .route(
            "/api/usage/transcription/validate",
            post(usage::validate_transcription),
        )
        .route(
            "/api/usage/exports",
            get(usage::check_exports).post(usage::record_exports),
        )
        .route("/api/usage/exports/validate", post(usage::validate_exports))
        // Provider push path
        .route("/api/webhooks/paddle", post(webhooks::paddle_webhook))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
