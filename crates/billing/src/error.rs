//! Billing error types
//!
//! Configuration errors are fatal and surface at startup; provider errors
//! are per-request and retryable by the end user. Callers rely on that
//! split, so new variants must land on one side or the other.

use thiserror::Error;

use crate::usage::LimitCheck;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Missing or invalid configuration (env vars, unseeded plan catalog).
    /// Startup-blocking; never caused by user input.
    #[error("billing configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport-level failure reaching Paddle (timeout, DNS, TLS).
    #[error("paddle request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Paddle answered with a non-2xx status.
    #[error("paddle api error ({status}): {message}")]
    ProviderApi { status: u16, message: String },

    /// Paddle answered 2xx but the body did not match the expected shape.
    #[error("unexpected paddle response: {0}")]
    ProviderResponse(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Operation attempted in a status that forbids it.
    #[error("{0}")]
    Conflict(String),

    /// Request input rejected before any side effect.
    #[error("{0}")]
    Validation(String),

    /// Usage recording rejected; carries the freshly computed limits so the
    /// API layer can attach current counters to the 429 response.
    #[error("quota exceeded: {}", check.message)]
    QuotaExceeded { check: Box<LimitCheck> },

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Webhook payload parsed but is missing required fields.
    #[error("invalid webhook payload: {0}")]
    WebhookPayload(String),

    #[error("date arithmetic out of range: {0}")]
    Time(#[from] time::error::ComponentRange),
}

impl BillingError {
    /// True when Paddle reported the resource as gone (404).
    ///
    /// Reconciliation treats this as "subscription no longer exists" rather
    /// than a fault; every other gateway error propagates fail-closed.
    pub fn is_provider_not_found(&self) -> bool {
        matches!(self, BillingError::ProviderApi { status: 404, .. })
    }

    /// True when the underlying database error is a uniqueness violation.
    ///
    /// Free provisioning uses this to detect "another request already
    /// inserted the row" and re-fetch instead of erroring.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            BillingError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
