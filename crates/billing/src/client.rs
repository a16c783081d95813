//! Paddle API client
//!
//! Thin authenticated wrapper over Paddle's REST API. Every call is
//! bearer-authenticated JSON with no-cache semantics and a bounded timeout;
//! responses arrive enveloped in `{"data": ...}`. Non-2xx responses are
//! parsed for Paddle's nested error detail with graceful fallback to the
//! raw body text, and 204 is treated as "no content" rather than attempting
//! JSON parsing.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Long-running provider calls (proration previews, portal sessions) can
/// take a while; bound them rather than hanging a request handler forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Paddle configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct PaddleConfig {
    /// API key for the Paddle REST API (`PADDLE_API_KEY`)
    pub api_key: String,
    /// Base URL, overridable for sandbox/testing (`PADDLE_API_URL`)
    pub api_base_url: String,
    /// Shared secret for webhook signature verification (`PADDLE_WEBHOOK_SECRET`)
    pub webhook_secret: String,
    /// Pre-configured customer portal URL; when set, payment-method updates
    /// skip the portal-session API call entirely (`PADDLE_CUSTOMER_PORTAL_URL`)
    pub customer_portal_url: Option<String>,
}

impl PaddleConfig {
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("PADDLE_API_KEY")
            .map_err(|_| BillingError::Config("PADDLE_API_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("PADDLE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("PADDLE_WEBHOOK_SECRET not set".to_string()))?;
        let api_base_url = std::env::var("PADDLE_API_URL")
            .unwrap_or_else(|_| "https://api.paddle.com".to_string());
        let customer_portal_url = std::env::var("PADDLE_CUSTOMER_PORTAL_URL")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(Self {
            api_key,
            api_base_url,
            webhook_secret,
            customer_portal_url,
        })
    }
}

/// Authenticated Paddle REST client
#[derive(Clone)]
pub struct PaddleClient {
    http: reqwest::Client,
    config: Arc<PaddleConfig>,
}

impl PaddleClient {
    pub fn new(config: PaddleConfig) -> BillingResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(PaddleConfig::from_env()?)
    }

    pub fn config(&self) -> &PaddleConfig {
        &self.config
    }

    /// Fetch the remote subscription. Errors with `ProviderApi { 404 }` when
    /// Paddle no longer knows the id; reconciliation maps that to
    /// "subscription gone".
    pub async fn get_subscription(&self, id: &str) -> BillingResult<RemoteSubscription> {
        self.send::<RemoteSubscription, ()>(Method::GET, &format!("/subscriptions/{id}"), None)
            .await?
            .ok_or_else(|| {
                BillingError::ProviderResponse("subscription fetch returned no body".to_string())
            })
    }

    /// PATCH the subscription (price/quantity/proration-mode changes).
    pub async fn update_subscription(
        &self,
        id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Option<RemoteSubscription>> {
        self.send(Method::PATCH, &format!("/subscriptions/{id}"), Some(update))
            .await
    }

    /// Cancel effective at the end of the current billing period. This is a
    /// scheduled change on the provider side, not immediate revocation.
    pub async fn cancel_at_period_end(
        &self,
        id: &str,
    ) -> BillingResult<Option<RemoteSubscription>> {
        let body = CancelRequest {
            effective_from: "next_billing_period",
        };
        self.send(
            Method::POST,
            &format!("/subscriptions/{id}/cancel"),
            Some(&body),
        )
        .await
    }

    /// Undo a pending scheduled change (e.g. a scheduled cancellation).
    pub async fn clear_scheduled_change(
        &self,
        id: &str,
    ) -> BillingResult<Option<RemoteSubscription>> {
        let body = ClearScheduledChange {
            scheduled_change: None,
        };
        self.send(Method::PATCH, &format!("/subscriptions/{id}"), Some(&body))
            .await
    }

    /// Schedule an item update to take effect at the next renewal.
    pub async fn schedule_plan_change(
        &self,
        id: &str,
        price_id: &str,
    ) -> BillingResult<Option<RemoteSubscription>> {
        let body = ScheduleChangeRequest {
            effective_from: "next_billing_period",
            items: vec![ItemUpdate {
                price_id: price_id.to_string(),
                quantity: 1,
            }],
        };
        self.send(
            Method::POST,
            &format!("/subscriptions/{id}/schedule_change"),
            Some(&body),
        )
        .await
    }

    /// Create a hosted update-payment-method transaction and return it.
    pub async fn create_payment_method_transaction(
        &self,
        id: &str,
    ) -> BillingResult<Option<RemoteTransaction>> {
        self.send::<RemoteTransaction, ()>(
            Method::POST,
            &format!("/subscriptions/{id}/update-payment-method"),
            None,
        )
        .await
    }

    /// Create a billing-portal session for a customer.
    pub async fn create_portal_session(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<RemotePortalSession>> {
        let body = PortalSessionRequest {
            customer_id: customer_id.to_string(),
        };
        self.send(Method::POST, "/billing-portal/sessions", Some(&body))
            .await
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> BillingResult<Option<T>> {
        let url = format!("{}{}", self.config.api_base_url, path);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.config.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = extract_error_message(&raw);
            tracing::warn!(
                %method,
                path = %path,
                status = status.as_u16(),
                message = %message,
                "Paddle API call failed"
            );
            return Err(BillingError::ProviderApi {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| BillingError::ProviderResponse(e.to_string()))?;
        Ok(Some(envelope.data))
    }
}

/// Pull the human-readable message out of Paddle's nested error shape,
/// falling back to the raw body text.
fn extract_error_message(raw: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(raw) {
        if let Some(error) = envelope.error {
            if let Some(detail) = error.detail {
                return detail;
            }
            if let Some(message) = error.message {
                return message;
            }
            if let Some(code) = error.code {
                return code;
            }
        }
    }
    if raw.is_empty() {
        "no response body".to_string()
    } else {
        raw.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    message: Option<String>,
    code: Option<String>,
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proration_billing_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemUpdate {
    pub price_id: String,
    pub quantity: u32,
}

#[derive(Debug, Serialize)]
struct CancelRequest {
    effective_from: &'static str,
}

/// Serializes to `{"scheduled_change": null}`, Paddle's idiom for undoing a
/// pending scheduled change.
#[derive(Debug, Serialize)]
struct ClearScheduledChange {
    scheduled_change: Option<()>,
}

#[derive(Debug, Serialize)]
struct ScheduleChangeRequest {
    effective_from: &'static str,
    items: Vec<ItemUpdate>,
}

#[derive(Debug, Serialize)]
struct PortalSessionRequest {
    customer_id: String,
}

// =============================================================================
// Response shapes
// =============================================================================
// Paddle payloads are loosely shaped; every nested field that can be absent
// is an Option here, and the accessor methods below encode the ordered
// fallbacks callers rely on.

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub current_billing_period: Option<RemoteBillingPeriod>,
    #[serde(default)]
    pub items: Vec<RemoteSubscriptionItem>,
    #[serde(default)]
    pub scheduled_change: Option<RemoteScheduledChange>,
    #[serde(default)]
    pub management_urls: Option<RemoteManagementUrls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBillingPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscriptionItem {
    #[serde(default)]
    pub price: Option<RemotePrice>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePrice {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteScheduledChange {
    pub action: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteManagementUrls {
    #[serde(default)]
    pub update_payment_method: Option<String>,
    #[serde(default)]
    pub cancel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTransaction {
    pub id: String,
    #[serde(default)]
    pub checkout: Option<RemoteCheckout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCheckout {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePortalSession {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub urls: Option<RemotePortalUrls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePortalUrls {
    #[serde(default)]
    pub general: Option<RemotePortalGeneral>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePortalGeneral {
    #[serde(default)]
    pub overview: Option<String>,
}

impl RemoteSubscription {
    /// Price id of the first item, Paddle's primary subscription item.
    pub fn first_price_id(&self) -> Option<&str> {
        self.items
            .iter()
            .find_map(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// The current billing window, when Paddle reports one.
    pub fn current_period(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        self.current_billing_period
            .as_ref()
            .map(|p| (p.starts_at, p.ends_at))
    }

    /// True when the reported billing window contains `now`.
    pub fn covers(&self, now: OffsetDateTime) -> bool {
        self.current_period()
            .map(|(starts_at, ends_at)| starts_at <= now && ends_at >= now)
            .unwrap_or(false)
    }

    /// True when Paddle grants access regardless of the reported window.
    pub fn grants_access(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// Effective date of a pending scheduled cancellation, if any.
    pub fn cancel_effective_at(&self) -> Option<OffsetDateTime> {
        self.scheduled_change
            .as_ref()
            .filter(|change| change.action == "cancel")
            .and_then(|change| change.effective_at)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn test_client(base_url: &str) -> PaddleClient {
        PaddleClient::new(PaddleConfig {
            api_key: "pdl_test_key".to_string(),
            api_base_url: base_url.to_string(),
            webhook_secret: "whsec".to_string(),
            customer_portal_url: None,
        })
        .unwrap()
    }

    const SUBSCRIPTION_BODY: &str = r#"{
        "data": {
            "id": "sub_123",
            "status": "active",
            "customer_id": "ctm_456",
            "current_billing_period": {
                "starts_at": "2025-06-01T00:00:00Z",
                "ends_at": "2025-07-01T00:00:00Z"
            },
            "items": [
                {"price": {"id": "pri_pro_month"}, "status": "active"}
            ],
            "scheduled_change": {
                "action": "cancel",
                "effective_at": "2025-07-01T00:00:00Z"
            }
        }
    }"#;

    #[tokio::test]
    async fn get_subscription_parses_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/subscriptions/sub_123")
            .match_header("authorization", "Bearer pdl_test_key")
            .match_header("cache-control", "no-cache")
            .with_status(200)
            .with_body(SUBSCRIPTION_BODY)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let sub = client.get_subscription("sub_123").await.unwrap();

        mock.assert_async().await;
        assert_eq!(sub.id, "sub_123");
        assert_eq!(sub.first_price_id(), Some("pri_pro_month"));
        assert!(sub.grants_access());
        assert!(sub.cancel_effective_at().is_some());
        let (starts_at, ends_at) = sub.current_period().unwrap();
        assert!(starts_at < ends_at);
    }

    #[tokio::test]
    async fn not_found_maps_to_provider_404() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions/sub_gone")
            .with_status(404)
            .with_body(
                r#"{"error": {"code": "entity_not_found", "detail": "Subscription not found"}}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let err = client.get_subscription("sub_gone").await.unwrap_err();

        assert!(err.is_provider_not_found());
        assert!(err.to_string().contains("Subscription not found"));
    }

    #[tokio::test]
    async fn error_message_falls_back_to_raw_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions/sub_123")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let client = test_client(&server.url());
        let err = client.get_subscription("sub_123").await.unwrap_err();

        match err {
            BillingError::ProviderApi { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_content_is_not_parsed_as_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/subscriptions/sub_123/cancel")
            .with_status(204)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let result = client.cancel_at_period_end("sub_123").await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn covers_requires_window_containing_now() {
        let body: Envelope<RemoteSubscription> = serde_json::from_str(SUBSCRIPTION_BODY).unwrap();
        let sub = body.data;
        let inside = time::macros::datetime!(2025-06-15 12:00 UTC);
        let after = time::macros::datetime!(2025-07-02 00:00 UTC);
        assert!(sub.covers(inside));
        assert!(!sub.covers(after));
    }

    #[test]
    fn clear_scheduled_change_serializes_null() {
        let body = ClearScheduledChange {
            scheduled_change: None,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"scheduled_change":null}"#
        );
    }
}
