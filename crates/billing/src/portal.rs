//! Hosted payment-method management
//!
//! Card data never touches local storage: payment-method updates resolve to
//! a Paddle-hosted URL and mutate no local state. The URL is resolved
//! through ordered alternatives:
//!
//! 1. a pre-configured static customer portal URL,
//! 2. a billing-portal session created for the subscription's customer,
//! 3. a hosted update-payment-method transaction for the subscription.

use crate::client::PaddleClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::Subscription;

/// Hosted portal URL returned to the caller.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalResponse {
    pub url: String,
}

/// Resolves Paddle-hosted billing management URLs.
pub struct PortalService {
    paddle: PaddleClient,
}

impl PortalService {
    pub fn new(paddle: PaddleClient) -> Self {
        Self { paddle }
    }

    /// Resolve a URL where the user can update their payment method.
    ///
    /// The subscription must already have passed the manageable-status
    /// guard; this only requires the remote counterpart to exist.
    pub async fn payment_method_url(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<PortalResponse> {
        let remote_id = subscription
            .paddle_subscription_id
            .as_deref()
            .ok_or_else(|| {
                BillingError::Conflict(
                    "subscription is locally managed and has no payment method".to_string(),
                )
            })?;

        if let Some(url) = &self.paddle.config().customer_portal_url {
            return Ok(PortalResponse { url: url.clone() });
        }

        if let Some(url) = self.portal_session_url(remote_id).await? {
            return Ok(PortalResponse { url });
        }

        if let Some(url) = self.payment_transaction_url(remote_id).await? {
            return Ok(PortalResponse { url });
        }

        Err(BillingError::ProviderResponse(
            "paddle returned no payment management URL".to_string(),
        ))
    }

    async fn portal_session_url(&self, remote_id: &str) -> BillingResult<Option<String>> {
        // The portal session is keyed by customer, so look the customer up
        // from the subscription first.
        let remote = self.paddle.get_subscription(remote_id).await?;
        let Some(customer_id) = remote.customer_id.as_deref() else {
            return Ok(None);
        };

        let session = match self.paddle.create_portal_session(customer_id).await {
            Ok(session) => session,
            Err(e) if e.is_provider_not_found() => {
                tracing::debug!(
                    customer_id = %customer_id,
                    "Billing portal unavailable; falling back to payment transaction"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(session
            .and_then(|s| s.urls)
            .and_then(|urls| urls.general)
            .and_then(|general| general.overview))
    }

    async fn payment_transaction_url(&self, remote_id: &str) -> BillingResult<Option<String>> {
        let transaction = self
            .paddle
            .create_payment_method_transaction(remote_id)
            .await?;
        Ok(transaction
            .and_then(|t| t.checkout)
            .and_then(|checkout| checkout.url))
    }
}
