//! Paddle webhook handling
//!
//! The push half of reconciliation. Paddle calls us on its own schedule;
//! verified events are applied as idempotent upserts keyed by the external
//! subscription id, independent of (and racing with) the resolver's pull
//! path. Both converge on the same rows, so last write wins and neither
//! direction can duplicate or corrupt state.
//!
//! Signature scheme: `Paddle-Signature: ts=<unix>;h1=<hex>` where `h1` is
//! HMAC-SHA256 over `"<ts>:<raw body>"` with the endpoint's shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{PaddleClient, RemoteBillingPeriod, RemoteScheduledChange};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::plans::PlanCatalog;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "Paddle-Signature";

/// Reject signatures whose timestamp drifts more than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Paddle webhook signature.
///
/// Missing header, missing secret, or a malformed structure all yield
/// `WebhookSignatureInvalid`, never a different error class that could be
/// mistaken for something else. Acceptance requires exact-length,
/// constant-time digest equality.
pub fn verify_paddle_signature(
    secret: &str,
    header: Option<&str>,
    raw_body: &[u8],
) -> BillingResult<()> {
    let header = header.ok_or(BillingError::WebhookSignatureInvalid)?;
    if secret.is_empty() {
        tracing::error!("Webhook secret is not configured; rejecting event");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // Parse `ts=<unix>;h1=<hex>`.
    let mut timestamp: Option<i64> = None;
    let mut digest_hex: Option<&str> = None;
    for part in header.split(';') {
        let mut kv = part.splitn(2, '=');
        match (kv.next().map(str::trim), kv.next()) {
            (Some("ts"), Some(value)) => timestamp = value.trim().parse().ok(),
            (Some("h1"), Some(value)) => digest_hex = Some(value.trim()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let digest_hex = digest_hex.ok_or(BillingError::WebhookSignatureInvalid)?;
    let claimed = hex::decode(digest_hex).map_err(|_| BillingError::WebhookSignatureInvalid)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now,
            drift = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    let computed = mac.finalize().into_bytes();

    if computed.len() != claimed.len() {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    if bool::from(computed.as_slice().ct_eq(claimed.as_slice())) {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// A parsed Paddle webhook envelope.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PaddleEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub event_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Subscription payload carried by `subscription.*` events.
#[derive(Debug, Clone, serde::Deserialize)]
struct EventSubscription {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    current_billing_period: Option<RemoteBillingPeriod>,
    #[serde(default)]
    items: Vec<EventItem>,
    #[serde(default)]
    scheduled_change: Option<RemoteScheduledChange>,
    #[serde(default)]
    custom_data: Option<EventCustomData>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct EventItem {
    #[serde(default)]
    price: Option<EventPrice>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct EventPrice {
    id: String,
}

/// Checkout metadata we require on subscription creation: which user and
/// plan the remote subscription belongs to.
#[derive(Debug, Clone, serde::Deserialize)]
struct EventCustomData {
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    plan_id: Option<Uuid>,
}

impl EventSubscription {
    fn first_price_id(&self) -> Option<&str> {
        self.items
            .iter()
            .find_map(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    fn cancel_effective_at(&self) -> Option<OffsetDateTime> {
        self.scheduled_change
            .as_ref()
            .filter(|change| change.action == "cancel")
            .and_then(|change| change.effective_at)
    }
}

/// What became of a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event mutated local state.
    Applied,
    /// Same event id seen before; skipped.
    Duplicate,
    /// Event type not modeled; accepted and ignored.
    Ignored,
}

/// Applies verified Paddle events to local subscription state.
pub struct WebhookHandler {
    paddle: PaddleClient,
    pool: PgPool,
    plans: PlanCatalog,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(paddle: PaddleClient, pool: PgPool) -> Self {
        let plans = PlanCatalog::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            paddle,
            pool,
            plans,
            event_logger,
        }
    }

    /// Verify the signature and parse the event. Verification failure must
    /// refuse the event entirely; nothing is trusted or persisted first.
    pub fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> BillingResult<PaddleEvent> {
        verify_paddle_signature(&self.paddle.config().webhook_secret, signature, raw_body)?;
        serde_json::from_slice(raw_body).map_err(|e| BillingError::WebhookPayload(e.to_string()))
    }

    /// Apply a verified event.
    ///
    /// Event-level idempotency: the event id is claimed atomically with
    /// `INSERT ... ON CONFLICT DO NOTHING RETURNING`; a redelivery finds
    /// the claim taken and returns `Duplicate` without reprocessing.
    /// Row-level idempotency: subscription events upsert on the external
    /// subscription id, so even an unclaimed replay cannot duplicate rows.
    pub async fn handle_event(&self, event: PaddleEvent) -> BillingResult<WebhookOutcome> {
        if let Some(event_id) = event.event_id.as_deref() {
            let claimed: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO paddle_webhook_events
                    (paddle_event_id, event_type, occurred_at, processing_result)
                VALUES ($1, $2, $3, 'processing')
                ON CONFLICT (paddle_event_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(event_id)
            .bind(&event.event_type)
            .bind(event.occurred_at)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_none() {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event.event_type,
                    "Duplicate webhook event; skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        let result = self.dispatch(&event).await;

        // Best-effort audit of the processing result; the claim row must
        // not fail the delivery.
        if let Some(event_id) = event.event_id.as_deref() {
            let (processing_result, error_message) = match &result {
                Ok(_) => ("success", None),
                Err(e) => ("error", Some(e.to_string())),
            };
            if let Err(e) = sqlx::query(
                r#"
                UPDATE paddle_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE paddle_event_id = $3
                "#,
            )
            .bind(processing_result)
            .bind(&error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await
            {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to update webhook audit record"
                );
            }
        }

        result
    }

    async fn dispatch(&self, event: &PaddleEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(
            event_type = %event.event_type,
            event_id = ?event.event_id,
            "Processing Paddle webhook event"
        );

        match event.event_type.as_str() {
            "subscription.created" | "subscription.activated" => {
                self.apply_subscription_created(event).await
            }
            "subscription.updated" | "subscription.resumed" => {
                self.apply_subscription_updated(event).await
            }
            "subscription.canceled" => self.apply_terminal_status(event, "canceled").await,
            "subscription.paused" => self.apply_terminal_status(event, "paused").await,
            other => {
                // Never fail the provider's delivery for event types we
                // don't model; that only causes retry storms.
                tracing::debug!(event_type = %other, "Ignoring unmodeled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    fn parse_subscription(event: &PaddleEvent) -> BillingResult<EventSubscription> {
        serde_json::from_value(event.data.clone())
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))
    }

    /// A new remote subscription. Requires the provider subscription id
    /// plus the user and plan carried in checkout metadata; rejects with a
    /// payload error when any are missing.
    async fn apply_subscription_created(
        &self,
        event: &PaddleEvent,
    ) -> BillingResult<WebhookOutcome> {
        let data = Self::parse_subscription(event)?;

        let paddle_subscription_id = data
            .id
            .as_deref()
            .ok_or_else(|| BillingError::WebhookPayload("data.id missing".to_string()))?;
        let custom = data.custom_data.as_ref().ok_or_else(|| {
            BillingError::WebhookPayload("custom_data missing from subscription event".to_string())
        })?;
        let user_id = custom
            .user_id
            .ok_or_else(|| BillingError::WebhookPayload("custom_data.user_id missing".to_string()))?;
        let plan_id = custom
            .plan_id
            .ok_or_else(|| BillingError::WebhookPayload("custom_data.plan_id missing".to_string()))?;

        let plan = self.plans.get(plan_id).await?.ok_or_else(|| {
            BillingError::WebhookPayload(format!("custom_data.plan_id {plan_id} is unknown"))
        })?;

        let now = OffsetDateTime::now_utc();
        let (starts_at, ends_at) = match &data.current_billing_period {
            Some(period) => (period.starts_at, Some(period.ends_at)),
            None => (now, None),
        };
        let status = data
            .status
            .as_deref()
            .and_then(normalize_status)
            .unwrap_or("active");
        let cancel_at = data.cancel_effective_at();

        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_id, status, starts_at, ends_at, auto_renew,
                 cancel_at, paddle_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (paddle_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                auto_renew = EXCLUDED.auto_renew,
                cancel_at = EXCLUDED.cancel_at,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan.id)
        .bind(status)
        .bind(starts_at)
        .bind(ends_at)
        .bind(cancel_at.is_none())
        .bind(cancel_at)
        .bind(paddle_subscription_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            paddle_subscription_id = %paddle_subscription_id,
            plan = %plan.name,
            status = %status,
            "Applied subscription activation from webhook"
        );
        self.audit(Some(user_id), event, paddle_subscription_id).await;

        Ok(WebhookOutcome::Applied)
    }

    /// An update to a known remote subscription, keyed by external id.
    /// Falls back to the creation path when the row does not exist yet and
    /// the payload carries full metadata (deliveries can arrive out of
    /// order).
    async fn apply_subscription_updated(
        &self,
        event: &PaddleEvent,
    ) -> BillingResult<WebhookOutcome> {
        let data = Self::parse_subscription(event)?;

        let paddle_subscription_id = data
            .id
            .as_deref()
            .ok_or_else(|| BillingError::WebhookPayload("data.id missing".to_string()))?;

        let plan_id = match data.first_price_id() {
            Some(price_id) => self.plans.get_by_price_id(price_id).await?.map(|p| p.id),
            None => None,
        };
        let status = data
            .status
            .as_deref()
            .and_then(normalize_status)
            .unwrap_or("active");
        let window = data
            .current_billing_period
            .as_ref()
            .map(|p| (p.starts_at, p.ends_at));
        let cancel_at = data.cancel_effective_at();

        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = COALESCE($1, plan_id),
                status = $2,
                starts_at = COALESCE($3, starts_at),
                ends_at = COALESCE($4, ends_at),
                auto_renew = $5,
                cancel_at = $6,
                updated_at = NOW()
            WHERE paddle_subscription_id = $7
            "#,
        )
        .bind(plan_id)
        .bind(status)
        .bind(window.map(|(starts_at, _)| starts_at))
        .bind(window.map(|(_, ends_at)| ends_at))
        .bind(cancel_at.is_none())
        .bind(cancel_at)
        .bind(paddle_subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            if data
                .custom_data
                .as_ref()
                .is_some_and(|c| c.user_id.is_some() && c.plan_id.is_some())
            {
                return self.apply_subscription_created(event).await;
            }
            tracing::warn!(
                paddle_subscription_id = %paddle_subscription_id,
                "Update event for unknown subscription without metadata; ignoring"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        tracing::info!(
            paddle_subscription_id = %paddle_subscription_id,
            status = %status,
            "Applied subscription update from webhook"
        );
        self.audit(None, event, paddle_subscription_id).await;

        Ok(WebhookOutcome::Applied)
    }

    /// Cancellation/pause events: a status transition, never a row removal.
    async fn apply_terminal_status(
        &self,
        event: &PaddleEvent,
        status: &str,
    ) -> BillingResult<WebhookOutcome> {
        let data = Self::parse_subscription(event)?;

        let paddle_subscription_id = data
            .id
            .as_deref()
            .ok_or_else(|| BillingError::WebhookPayload("data.id missing".to_string()))?;

        let ends_at = data
            .current_billing_period
            .as_ref()
            .map(|p| p.ends_at)
            .or_else(|| data.cancel_effective_at());

        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1,
                auto_renew = FALSE,
                ends_at = COALESCE($2, ends_at, NOW()),
                cancel_at = COALESCE(cancel_at, $2, ends_at, NOW()),
                updated_at = NOW()
            WHERE paddle_subscription_id = $3
            "#,
        )
        .bind(status)
        .bind(ends_at)
        .bind(paddle_subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            tracing::warn!(
                paddle_subscription_id = %paddle_subscription_id,
                "Terminal event for unknown subscription; ignoring"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        tracing::info!(
            paddle_subscription_id = %paddle_subscription_id,
            status = %status,
            "Applied terminal subscription status from webhook"
        );
        self.audit(None, event, paddle_subscription_id).await;

        Ok(WebhookOutcome::Applied)
    }

    async fn audit(&self, user_id: Option<Uuid>, event: &PaddleEvent, remote_id: &str) {
        if let Err(e) = self
            .event_logger
            .log(
                user_id,
                BillingEventType::WebhookApplied,
                serde_json::json!({
                    "event_type": event.event_type,
                    "event_id": event.event_id,
                    "paddle_subscription_id": remote_id,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log webhook audit event");
        }
    }
}

/// Map a remote status string onto the local vocabulary; unknown statuses
/// are not applied.
pub(crate) fn normalize_status(remote: &str) -> Option<&'static str> {
    match remote {
        "active" => Some("active"),
        "trialing" => Some("trialing"),
        "paused" => Some("paused"),
        "canceled" => Some("canceled"),
        "past_due" => Some("canceled"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "pdl_ntfset_test_secret";

    fn sign(secret: &str, ts: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b":");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn correct_signature_passes() {
        let body = br#"{"event_type":"subscription.activated"}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, body));

        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"event_type":"subscription.activated"}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign("other_secret", ts, body));

        assert!(matches!(
            verify_paddle_signature(SECRET, Some(&header), body),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn missing_header_fails() {
        assert!(matches!(
            verify_paddle_signature(SECRET, None, b"{}"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn missing_h1_field_fails() {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={ts}");
        assert!(matches!(
            verify_paddle_signature(SECRET, Some(&header), b"{}"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn missing_secret_fails() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, body));
        assert!(matches!(
            verify_paddle_signature("", Some(&header), body),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn stale_timestamp_fails() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 10;
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, body));
        assert!(matches!(
            verify_paddle_signature(SECRET, Some(&header), body),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn tampered_body_fails() {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, b"original"));
        assert!(matches!(
            verify_paddle_signature(SECRET, Some(&header), b"tampered"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn malformed_hex_fails() {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={ts};h1=zz-not-hex");
        assert!(matches!(
            verify_paddle_signature(SECRET, Some(&header), b"{}"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn event_subscription_extracts_metadata() {
        let event: PaddleEvent = serde_json::from_str(
            r#"{
                "event_id": "evt_1",
                "event_type": "subscription.activated",
                "occurred_at": "2025-06-01T00:00:00Z",
                "data": {
                    "id": "sub_1",
                    "status": "active",
                    "custom_data": {
                        "user_id": "7f8a1b9e-4c3d-4e2f-9a1b-0c2d3e4f5a6b",
                        "plan_id": "1a2b3c4d-5e6f-4a1b-8c2d-3e4f5a6b7c8d"
                    },
                    "items": [{"price": {"id": "pri_pro_month"}}],
                    "current_billing_period": {
                        "starts_at": "2025-06-01T00:00:00Z",
                        "ends_at": "2025-07-01T00:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();

        let data: EventSubscription = serde_json::from_value(event.data).unwrap();
        assert_eq!(data.id.as_deref(), Some("sub_1"));
        assert_eq!(data.first_price_id(), Some("pri_pro_month"));
        let custom = data.custom_data.unwrap();
        assert!(custom.user_id.is_some());
        assert!(custom.plan_id.is_some());
    }

    #[test]
    fn scheduled_cancel_surfaces_effective_date() {
        let data: EventSubscription = serde_json::from_str(
            r#"{
                "id": "sub_1",
                "scheduled_change": {
                    "action": "cancel",
                    "effective_at": "2025-07-01T00:00:00Z"
                }
            }"#,
        )
        .unwrap();
        assert!(data.cancel_effective_at().is_some());

        let pause: EventSubscription = serde_json::from_str(
            r#"{
                "id": "sub_1",
                "scheduled_change": {
                    "action": "pause",
                    "effective_at": "2025-07-01T00:00:00Z"
                }
            }"#,
        )
        .unwrap();
        assert!(pause.cancel_effective_at().is_none());
    }

    #[test]
    fn status_normalization_rejects_unknown_values() {
        assert_eq!(normalize_status("active"), Some("active"));
        assert_eq!(normalize_status("past_due"), Some("canceled"));
        assert_eq!(normalize_status("definitely_not_a_status"), None);
    }
}
