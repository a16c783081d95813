//! Subscription management
//!
//! The subscription row binds a user to a plan for a billing window. Every
//! mutation here follows the remote-then-local two-phase pattern: Paddle's
//! authoritative subscription is mutated first, then the local row is
//! projected from the response so it stays usable between webhook
//! deliveries. A remote failure aborts the operation with no local write;
//! a remote success followed by a local write failure is healed by the
//! next webhook or resolver pass.

use scribe_shared::{ProrationMode, SubscriptionStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ItemUpdate, PaddleClient, SubscriptionUpdate};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::plans::{Plan, PlanCatalog};

/// The mutable entitlement record.
///
/// `paddle_subscription_id = NULL` marks a locally-managed row (the Free
/// tier) with no remote counterpart. Rows are never hard-deleted; expiry
/// and cancellation are status transitions.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub starts_at: OffsetDateTime,
    /// End of the current billing window; `None` = open-ended.
    pub ends_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    /// Scheduled-effective-date of a pending cancellation or downgrade.
    pub cancel_at: Option<OffsetDateTime>,
    pub paddle_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse_str(&self.status)
    }

    /// A row with no remote counterpart; its window self-renews without
    /// ever touching the network.
    pub fn is_locally_managed(&self) -> bool {
        self.paddle_subscription_id.is_none()
    }

    /// True when the effective window still covers `now`: `starts_at <=
    /// now` and `ends_at` is absent (open-ended) or not yet passed.
    pub fn window_contains(&self, now: OffsetDateTime) -> bool {
        self.starts_at <= now && self.ends_at.map_or(true, |ends_at| ends_at >= now)
    }

    pub fn is_manageable(&self) -> bool {
        self.status().map(|s| s.is_manageable()).unwrap_or(false)
    }
}

/// Result of a plan change operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeResult {
    pub subscription: Subscription,
    pub plan: Plan,
    /// True when the change is deferred to the next renewal.
    pub scheduled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
    pub message: String,
}

/// Subscription service driving Paddle-backed billing operations.
pub struct SubscriptionService {
    paddle: PaddleClient,
    pool: PgPool,
    plans: PlanCatalog,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
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

    /// Most recent row of any status, used to distinguish "nothing to
    /// manage" (404) from "exists but not manageable" (409).
    async fn fetch_any(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
            ORDER BY updated_at DESC, ends_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Guard shared by all billing operations: the user must hold a
    /// manageable (`active`/`trialing`) subscription, checked before any
    /// Paddle call is made.
    pub async fn require_manageable(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .fetch_any(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("subscription".to_string()))?;

        if !subscription.is_manageable() {
            return Err(BillingError::Conflict(format!(
                "subscription is {} and cannot be managed",
                subscription.status
            )));
        }
        Ok(subscription)
    }

    fn require_remote_id(subscription: &Subscription) -> BillingResult<&str> {
        subscription
            .paddle_subscription_id
            .as_deref()
            .ok_or_else(|| {
                BillingError::Conflict(
                    "subscription is locally managed and has no billing account to update"
                        .to_string(),
                )
            })
    }

    // =========================================================================
    // Auto-renew toggle
    // =========================================================================

    /// Set the auto-renew intent. No-ops (without a Paddle call) when the
    /// requested state equals the current one.
    ///
    /// Enabling clears any scheduled cancellation remotely and locally.
    /// Disabling schedules a cancel at the end of the current billing
    /// period and stores the remote's effective date (falling back to the
    /// local `ends_at`) as `cancel_at`.
    pub async fn set_auto_renew(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self.require_manageable(user_id).await?;

        if subscription.auto_renew == enabled {
            tracing::debug!(user_id = %user_id, enabled, "Auto-renew already in requested state");
            return Ok(subscription);
        }

        let remote_id = Self::require_remote_id(&subscription)?;

        let cancel_at = if enabled {
            self.paddle.clear_scheduled_change(remote_id).await?;
            None
        } else {
            let remote = self.paddle.cancel_at_period_end(remote_id).await?;
            remote
                .and_then(|r| r.cancel_effective_at())
                .or(subscription.ends_at)
        };

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET auto_renew = $1, cancel_at = $2, updated_at = NOW()
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(cancel_at)
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            enabled,
            cancel_at = ?updated.cancel_at,
            "Auto-renew updated"
        );

        let event_type = if enabled {
            BillingEventType::AutoRenewEnabled
        } else {
            BillingEventType::AutoRenewDisabled
        };
        if let Err(e) = self
            .event_logger
            .log(
                Some(user_id),
                event_type,
                serde_json::json!({
                    "subscription_id": updated.id,
                    "cancel_at": updated.cancel_at.map(|t| t.to_string()),
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log auto-renew event");
        }

        Ok(updated)
    }

    // =========================================================================
    // Plan change
    // =========================================================================

    /// Change the subscription's plan.
    ///
    /// `Immediate` PATCHes the remote subscription with the new price and
    /// prorated billing, then projects the new plan id (and whatever
    /// billing-window dates the response includes) locally. The webhook
    /// remains the ultimate source of truth for the plan id.
    /// `NextBillingPeriod` schedules a deferred item update and leaves the
    /// local row unchanged.
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_plan_id: Uuid,
        mode: ProrationMode,
    ) -> BillingResult<PlanChangeResult> {
        let subscription = self.require_manageable(user_id).await?;
        let remote_id = Self::require_remote_id(&subscription)?;

        let plan = self
            .plans
            .get(new_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {new_plan_id}")))?;
        let price_id = plan.paddle_price_id.as_deref().ok_or_else(|| {
            BillingError::Conflict(format!(
                "plan '{}' has no billing price; disable auto-renew to drop to the free tier",
                plan.name
            ))
        })?;

        match mode {
            ProrationMode::Immediate => {
                let update = SubscriptionUpdate {
                    items: Some(vec![ItemUpdate {
                        price_id: price_id.to_string(),
                        quantity: 1,
                    }]),
                    proration_billing_mode: Some("prorated_immediately".to_string()),
                };
                let remote = self.paddle.update_subscription(remote_id, &update).await?;

                let window = remote.as_ref().and_then(|r| r.current_period());
                let (starts_at, ends_at) = match window {
                    Some((starts_at, ends_at)) => (Some(starts_at), Some(ends_at)),
                    None => (None, None),
                };

                let updated = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET plan_id = $1,
                        starts_at = COALESCE($2, starts_at),
                        ends_at = COALESCE($3, ends_at),
                        updated_at = NOW()
                    WHERE id = $4
                    RETURNING *
                    "#,
                )
                .bind(plan.id)
                .bind(starts_at)
                .bind(ends_at)
                .bind(subscription.id)
                .fetch_one(&self.pool)
                .await?;

                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %updated.id,
                    plan = %plan.name,
                    "Plan change applied with immediate proration"
                );

                if let Err(e) = self
                    .event_logger
                    .log(
                        Some(user_id),
                        BillingEventType::PlanChangeApplied,
                        serde_json::json!({
                            "subscription_id": updated.id,
                            "plan_id": plan.id,
                            "plan": plan.name,
                        }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log plan change event");
                }

                let message = format!("Switched to the {} plan", plan.name);
                Ok(PlanChangeResult {
                    subscription: updated,
                    plan,
                    scheduled: false,
                    effective_at: None,
                    message,
                })
            }
            ProrationMode::NextBillingPeriod => {
                let remote = self.paddle.schedule_plan_change(remote_id, price_id).await?;

                let effective_at = remote
                    .and_then(|r| r.scheduled_change.and_then(|c| c.effective_at))
                    .or(subscription.ends_at);

                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    plan = %plan.name,
                    effective_at = ?effective_at,
                    "Plan change scheduled for next billing period"
                );

                if let Err(e) = self
                    .event_logger
                    .log(
                        Some(user_id),
                        BillingEventType::PlanChangeScheduled,
                        serde_json::json!({
                            "subscription_id": subscription.id,
                            "plan_id": plan.id,
                            "plan": plan.name,
                            "effective_at": effective_at.map(|t| t.to_string()),
                        }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log scheduled plan change event");
                }

                let message = match effective_at {
                    Some(at) => format!("Switch to the {} plan scheduled for {at}", plan.name),
                    None => format!(
                        "Switch to the {} plan scheduled for the next renewal",
                        plan.name
                    ),
                };
                Ok(PlanChangeResult {
                    subscription,
                    plan,
                    scheduled: true,
                    effective_at,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use time::macros::datetime;

    fn subscription(ends_at: Option<OffsetDateTime>, status: &str) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: status.to_string(),
            starts_at: datetime!(2025-06-01 00:00 UTC),
            ends_at,
            auto_renew: true,
            cancel_at: None,
            paddle_subscription_id: Some("sub_1".to_string()),
            created_at: datetime!(2025-06-01 00:00 UTC),
            updated_at: datetime!(2025-06-01 00:00 UTC),
        }
    }

    #[test]
    fn window_contains_handles_bounded_and_open_windows() {
        let bounded = subscription(Some(datetime!(2025-07-01 00:00 UTC)), "active");
        assert!(bounded.window_contains(datetime!(2025-06-15 00:00 UTC)));
        assert!(!bounded.window_contains(datetime!(2025-07-02 00:00 UTC)));
        assert!(!bounded.window_contains(datetime!(2025-05-31 00:00 UTC)));

        let open = subscription(None, "active");
        assert!(open.window_contains(datetime!(2099-01-01 00:00 UTC)));
    }

    #[test]
    fn manageable_requires_active_or_trialing() {
        assert!(subscription(None, "active").is_manageable());
        assert!(subscription(None, "trialing").is_manageable());
        assert!(!subscription(None, "paused").is_manageable());
        assert!(!subscription(None, "canceled").is_manageable());
        assert!(!subscription(None, "garbage").is_manageable());
    }

    #[test]
    fn locally_managed_means_no_remote_id() {
        let mut sub = subscription(None, "active");
        assert!(!sub.is_locally_managed());
        sub.paddle_subscription_id = None;
        assert!(sub.is_locally_managed());
    }
}
