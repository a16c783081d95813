//! Metered usage endpoints
//!
//! Check endpoints are read-only; validate is advisory; record is the
//! enforcement boundary and answers 429 with the current limits attached
//! when the write would exceed quota.

use axum::extract::State;
use axum::Json;
use scribe_billing::{LimitCheck, UsageKind, UsageValidation};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionLimitResponse {
    pub can_transcribe: bool,
    pub message: String,
    pub remaining_minutes: Option<i64>,
    pub plan_limit: Option<i64>,
    pub used_minutes: i64,
    pub billing_interval: Option<String>,
}

impl From<LimitCheck> for TranscriptionLimitResponse {
    fn from(check: LimitCheck) -> Self {
        Self {
            can_transcribe: check.allowed,
            message: check.message,
            remaining_minutes: check.remaining,
            plan_limit: check.plan_limit,
            used_minutes: check.used,
            billing_interval: check.billing_interval,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportLimitResponse {
    pub can_export: bool,
    pub message: String,
    pub remaining: Option<i64>,
    pub plan_limit: Option<i64>,
    pub used: i64,
    pub billing_interval: Option<String>,
}

impl From<LimitCheck> for ExportLimitResponse {
    fn from(check: LimitCheck) -> Self {
        Self {
            can_export: check.allowed,
            message: check.message,
            remaining: check.remaining,
            plan_limit: check.plan_limit,
            used: check.used,
            billing_interval: check.billing_interval,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub can_proceed: bool,
    pub message: String,
    pub warning: Option<String>,
}

impl From<UsageValidation> for ValidationResponse {
    fn from(validation: UsageValidation) -> Self {
        Self {
            can_proceed: validation.allowed,
            message: validation.message,
            warning: validation.warning,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionRequest {
    pub minutes: i64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub quantity: i64,
    #[serde(default)]
    pub format: Option<String>,
}

pub async fn check_transcription(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<TranscriptionLimitResponse>, ApiError> {
    let check = state
        .billing
        .usage
        .check_limit(user_id, UsageKind::Transcription)
        .await?;
    Ok(Json(check.into()))
}

pub async fn validate_transcription(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<TranscriptionRequest>,
) -> Result<Json<ValidationResponse>, ApiError> {
    let validation = state
        .billing
        .usage
        .validate(user_id, UsageKind::Transcription, request.minutes)
        .await?;
    Ok(Json(validation.into()))
}

pub async fn record_transcription(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<TranscriptionRequest>,
) -> Result<Json<TranscriptionLimitResponse>, ApiError> {
    let check = state
        .billing
        .usage
        .record(
            user_id,
            UsageKind::Transcription,
            request.minutes,
            request.source.as_deref(),
        )
        .await?;
    Ok(Json(check.into()))
}

pub async fn check_exports(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ExportLimitResponse>, ApiError> {
    let check = state
        .billing
        .usage
        .check_limit(user_id, UsageKind::Export)
        .await?;
    Ok(Json(check.into()))
}

pub async fn validate_exports(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ValidationResponse>, ApiError> {
    let validation = state
        .billing
        .usage
        .validate(user_id, UsageKind::Export, request.quantity)
        .await?;
    Ok(Json(validation.into()))
}

pub async fn record_exports(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ExportLimitResponse>, ApiError> {
    let check = state
        .billing
        .usage
        .record(
            user_id,
            UsageKind::Export,
            request.quantity,
            request.format.as_deref(),
        )
        .await?;
    Ok(Json(check.into()))
}
