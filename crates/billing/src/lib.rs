// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::QuotaExceeded carries the computed limits
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Scribe Billing Module
//!
//! Subscription reconciliation and entitlement resolution against Paddle.
//!
//! ## Features
//!
//! - **Entitlement Resolution**: every check resolves one effective
//!   (subscription, plan) pair, with lazy reconciliation and a guaranteed
//!   Free-tier fallback
//! - **Usage Metering**: transcription minutes and document exports per
//!   billing window, with quota enforcement at record time
//! - **Billing Operations**: auto-renew toggle, plan changes, hosted
//!   payment-method management
//! - **Webhooks**: verified, idempotent application of Paddle events
//! - **Invariants**: runnable consistency checks over billing state

pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod invariants;
pub mod plans;
pub mod portal;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{PaddleClient, PaddleConfig, RemoteSubscription};

// Entitlement
pub use entitlement::{Entitlement, EntitlementService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{Plan, PlanCatalog, FREE_PLAN_NAME};

// Portal
pub use portal::{PortalResponse, PortalService};

// Subscriptions
pub use subscriptions::{PlanChangeResult, Subscription, SubscriptionService};

// Usage
pub use usage::{LimitCheck, UsageKind, UsagePolicy, UsageValidation, UsageWindow};

// Webhooks
pub use webhooks::{
    verify_paddle_signature, PaddleEvent, WebhookHandler, WebhookOutcome, SIGNATURE_HEADER,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub entitlements: EntitlementService,
    pub invariants: InvariantChecker,
    pub plans: PlanCatalog,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub usage: UsagePolicy,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let paddle = PaddleClient::from_env()?;
        Ok(Self::new_with_client(paddle, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: PaddleConfig, pool: PgPool) -> BillingResult<Self> {
        let paddle = PaddleClient::new(config)?;
        Ok(Self::new_with_client(paddle, pool))
    }

    fn new_with_client(paddle: PaddleClient, pool: PgPool) -> Self {
        Self {
            entitlements: EntitlementService::new(paddle.clone(), pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            plans: PlanCatalog::new(pool.clone()),
            portal: PortalService::new(paddle.clone()),
            subscriptions: SubscriptionService::new(paddle.clone(), pool.clone()),
            usage: UsagePolicy::new(paddle.clone(), pool.clone()),
            webhooks: WebhookHandler::new(paddle, pool),
        }
    }
}
