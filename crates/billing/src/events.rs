//! Billing event audit log
//!
//! Append-only record of every billing mutation (operations, webhook
//! applications, reconciliation outcomes). Logging failures are warned and
//! swallowed by callers; the audit trail must never fail the operation it
//! describes.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    AutoRenewEnabled,
    AutoRenewDisabled,
    PlanChangeApplied,
    PlanChangeScheduled,
    SubscriptionReconciled,
    SubscriptionExpired,
    FreeProvisioned,
    WebhookApplied,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::AutoRenewEnabled => "auto_renew_enabled",
            BillingEventType::AutoRenewDisabled => "auto_renew_disabled",
            BillingEventType::PlanChangeApplied => "plan_change_applied",
            BillingEventType::PlanChangeScheduled => "plan_change_scheduled",
            BillingEventType::SubscriptionReconciled => "subscription_reconciled",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::FreeProvisioned => "free_provisioned",
            BillingEventType::WebhookApplied => "webhook_applied",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(
        &self,
        user_id: Option<Uuid>,
        event_type: BillingEventType,
        data: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query("INSERT INTO billing_events (user_id, event_type, data) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(event_type.as_str())
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings_are_stable() {
        assert_eq!(
            BillingEventType::AutoRenewEnabled.as_str(),
            "auto_renew_enabled"
        );
        assert_eq!(BillingEventType::WebhookApplied.as_str(), "webhook_applied");
        assert_eq!(
            BillingEventType::PlanChangeScheduled.to_string(),
            "plan_change_scheduled"
        );
    }
}
