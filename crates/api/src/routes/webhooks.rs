//! Paddle webhook endpoint
//!
//! Verification happens before anything is trusted or persisted; a failed
//! signature is rejected (never 200). Unmodeled event types are accepted
//! and ignored so the provider does not retry-storm us.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use scribe_billing::{WebhookOutcome, SIGNATURE_HEADER};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn paddle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let event = state.billing.webhooks.verify(&body, signature)?;
    let outcome = state.billing.webhooks.handle_event(event).await?;

    let outcome_str = match outcome {
        WebhookOutcome::Applied => "applied",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "outcome": outcome_str })),
    ))
}
