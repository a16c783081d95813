//! Billing operation endpoints

use axum::extract::State;
use axum::Json;
use scribe_billing::{
    Entitlement, InvariantCheckSummary, Plan, PlanChangeResult, Subscription,
};
use scribe_shared::{BillingInterval, ProrationMode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// The resolved entitlement projected for the UI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    pub billing_interval: Option<BillingInterval>,
    pub upload_limit_mb: i32,
    pub transcription_minutes: Option<i32>,
    pub summarization_limit: Option<i32>,
    pub export_limit: Option<i32>,
    pub premium_templates: bool,
    pub archive_access: bool,
}

impl SubscriptionSummary {
    fn from_parts(subscription: &Subscription, plan: &Plan) -> Self {
        Self {
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            status: subscription.status.clone(),
            starts_at: subscription.starts_at,
            ends_at: subscription.ends_at,
            auto_renew: subscription.auto_renew,
            cancel_at: subscription.cancel_at,
            billing_interval: plan
                .billing_interval
                .as_deref()
                .and_then(BillingInterval::parse_str),
            upload_limit_mb: plan.upload_limit_mb,
            transcription_minutes: plan.transcription_minutes,
            summarization_limit: plan.summarization_limit,
            export_limit: plan.export_limit,
            premium_templates: plan.premium_templates,
            archive_access: plan.archive_access,
        }
    }
}

impl From<Entitlement> for SubscriptionSummary {
    fn from(entitlement: Entitlement) -> Self {
        Self::from_parts(&entitlement.subscription, &entitlement.plan)
    }
}

pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<Plan>>, ApiError> {
    let plans = state.billing.plans.list().await?;
    Ok(Json(plans))
}

pub async fn subscription_summary(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<SubscriptionSummary>, ApiError> {
    let entitlement = state
        .billing
        .entitlements
        .ensure_active_subscription(user_id)
        .await?
        .ok_or_else(|| {
            tracing::error!(user_id = %user_id, "No entitlement available; plan catalog unseeded");
            ApiError::forbidden("No subscription available; contact support")
        })?;
    Ok(Json(entitlement.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRenewRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRenewResponse {
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    pub status: String,
}

pub async fn set_auto_renew(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<AutoRenewRequest>,
) -> Result<Json<AutoRenewResponse>, ApiError> {
    let subscription = state
        .billing
        .subscriptions
        .set_auto_renew(user_id, request.enabled)
        .await?;
    Ok(Json(AutoRenewResponse {
        auto_renew: subscription.auto_renew,
        cancel_at: subscription.cancel_at,
        status: subscription.status,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeRequest {
    pub plan_id: Uuid,
    #[serde(default = "default_proration")]
    pub proration: ProrationMode,
}

fn default_proration() -> ProrationMode {
    ProrationMode::Immediate
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeResponse {
    pub scheduled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
    pub message: String,
    pub subscription: SubscriptionSummary,
}

impl From<PlanChangeResult> for PlanChangeResponse {
    fn from(result: PlanChangeResult) -> Self {
        let subscription = SubscriptionSummary::from_parts(&result.subscription, &result.plan);
        Self {
            scheduled: result.scheduled,
            effective_at: result.effective_at,
            message: result.message,
            subscription,
        }
    }
}

pub async fn change_plan(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<PlanChangeRequest>,
) -> Result<Json<PlanChangeResponse>, ApiError> {
    let result = state
        .billing
        .subscriptions
        .change_plan(user_id, request.plan_id, request.proration)
        .await?;
    Ok(Json(result.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodResponse {
    pub url: String,
}

/// Resolve a Paddle-hosted URL for updating the payment method. No local
/// state is touched; card data never reaches this service.
pub async fn payment_method(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PaymentMethodResponse>, ApiError> {
    let subscription = state.billing.subscriptions.require_manageable(user_id).await?;
    let portal = state.billing.portal.payment_method_url(&subscription).await?;
    Ok(Json(PaymentMethodResponse { url: portal.url }))
}

/// Operator endpoint: run the billing consistency checks.
pub async fn run_invariants(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            requested_by = %user_id,
            violations = summary.violations.len(),
            "Billing invariant violations detected"
        );
    }
    Ok(Json(summary))
}
