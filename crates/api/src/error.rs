//! API error taxonomy
//!
//! Maps billing errors onto HTTP statuses. Every response body carries a
//! structured message plus `retryable` so a thin UI layer can distinguish
//! "you need to act" (subscribe, upgrade, fix the request) from "something
//! went wrong" (retry later) without inspecting internals.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scribe_billing::{BillingError, LimitCheck};

/// Error response produced by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Attached current counters for quota rejections (429).
    pub limits: Option<Box<LimitCheck>>,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Authentication required".to_string(),
            limits: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            limits: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            limits: None,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            // Configuration and persistence faults are internal; never leak
            // detail beyond the log line.
            BillingError::Config(message) => {
                tracing::error!(error = %message, "Billing configuration error");
                Self::internal("Billing is not configured correctly")
            }
            BillingError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                Self::internal("Something went wrong, please try again")
            }
            BillingError::Time(e) => {
                tracing::error!(error = %e, "Date arithmetic error");
                Self::internal("Something went wrong, please try again")
            }

            // Upstream provider failures surface as 502 with the original
            // message preserved for operator diagnosis.
            BillingError::Http(e) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: format!("Billing provider unreachable: {e}"),
                limits: None,
            },
            BillingError::ProviderApi { status, message } => Self {
                status: StatusCode::BAD_GATEWAY,
                message: format!("Billing provider error ({status}): {message}"),
                limits: None,
            },
            BillingError::ProviderResponse(message) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: format!("Billing provider returned an unexpected response: {message}"),
                limits: None,
            },

            BillingError::NotFound(what) => Self {
                status: StatusCode::NOT_FOUND,
                message: format!("{what} not found"),
                limits: None,
            },
            BillingError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                message,
                limits: None,
            },
            BillingError::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
                limits: None,
            },
            BillingError::QuotaExceeded { check } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: check.message.clone(),
                limits: Some(check),
            },

            BillingError::WebhookSignatureInvalid => Self {
                status: StatusCode::UNAUTHORIZED,
                message: "Webhook signature verification failed".to_string(),
                limits: None,
            },
            BillingError::WebhookPayload(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message: format!("Invalid webhook payload: {message}"),
                limits: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retryable = self.status.is_server_error();
        let body = match self.limits {
            Some(limits) => serde_json::json!({
                "error": self.message,
                "retryable": retryable,
                "limits": limits,
            }),
            None => serde_json::json!({
                "error": self.message,
                "retryable": retryable,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn provider_failures_map_to_bad_gateway() {
        let err: ApiError = BillingError::ProviderApi {
            status: 503,
            message: "maintenance".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.message.contains("maintenance"));
    }

    #[test]
    fn conflict_and_not_found_keep_their_statuses() {
        let conflict: ApiError = BillingError::Conflict("busy".to_string()).into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let missing: ApiError = BillingError::NotFound("subscription".to_string()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn signature_failures_are_unauthorized_not_ok() {
        let err: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn config_errors_do_not_leak_detail() {
        let err: ApiError = BillingError::Config("PADDLE_API_KEY not set".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("PADDLE_API_KEY"));
    }
}
