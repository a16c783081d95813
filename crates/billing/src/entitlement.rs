//! Entitlement resolution
//!
//! `EntitlementService::ensure_active_subscription` is the single entry
//! point every entitlement check goes through. It returns the one effective
//! (subscription, plan) pair for a user, reconciling the local row against
//! Paddle only when the cached billing window has lapsed, and provisioning
//! the Free tier exactly once per user when nothing else grants access.
//!
//! The overwhelming majority of calls take the fast path: the cached
//! window still contains "now" and no network call is made.

use sqlx::PgPool;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::client::{PaddleClient, RemoteSubscription};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::plans::{Plan, PlanCatalog};
use crate::subscriptions::Subscription;

/// The resolved (subscription, plan) pair a user is currently entitled to.
#[derive(Debug, Clone)]
pub struct Entitlement {
    pub subscription: Subscription,
    pub plan: Plan,
}

/// Resolves and reconciles the effective subscription for a user.
pub struct EntitlementService {
    paddle: PaddleClient,
    pool: PgPool,
    plans: PlanCatalog,
    event_logger: BillingEventLogger,
}

impl EntitlementService {
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

    /// Resolve the user's effective entitlement, reconciling or
    /// provisioning as needed.
    ///
    /// Returns `Ok(None)` only when the Free plan is not seeded: a
    /// configuration fault the caller must surface, not retry. Every other
    /// "no entitlement yet" case resolves to a freshly provisioned Free
    /// subscription. Gateway errors other than a remote 404 propagate
    /// fail-closed; entitlement is never granted on an unverified window.
    pub async fn ensure_active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        let now = OffsetDateTime::now_utc();

        let Some(subscription) = self.fetch_current(user_id).await? else {
            return self.provision_free(user_id, now).await;
        };
        let plan = self.plan_for(&subscription).await?;

        // Fast path: cached window still covers now.
        if subscription.window_contains(now) {
            return Ok(Some(Entitlement { subscription, plan }));
        }

        // Lapsed window. Free (or any locally-managed) entitlement
        // self-renews on month boundaries and never needs the network.
        if plan.is_free() || subscription.is_locally_managed() {
            let refreshed = self.roll_free_window(&subscription, now).await?;
            return Ok(Some(Entitlement {
                subscription: refreshed,
                plan,
            }));
        }

        // Lapsed paid subscription: reconcile against Paddle.
        self.reconcile_remote(user_id, subscription, plan, now)
            .await
    }

    /// Latest entitlement-bearing row for the user with its deterministic
    /// duplicate resolution (most recently updated, then latest `ends_at`;
    /// `NULL` sorts open-ended/greatest under `DESC`).
    async fn fetch_current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            ORDER BY updated_at DESC, ends_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    async fn plan_for(&self, subscription: &Subscription) -> BillingResult<Plan> {
        self.plans.get(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::Config(format!(
                "subscription {} references missing plan {}",
                subscription.id, subscription.plan_id
            ))
        })
    }

    /// Roll a lapsed locally-managed window forward to the current month
    /// boundary. Free entitlement is self-renewing: `auto_renew` stays
    /// false and any stale `cancel_at` is cleared.
    async fn roll_free_window(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let (starts_at, ends_at) = current_month_window(now)?;

        let refreshed = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET starts_at = $1,
                ends_at = $2,
                status = 'active',
                auto_renew = FALSE,
                cancel_at = NULL,
                updated_at = NOW()
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(starts_at)
        .bind(ends_at)
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            user_id = %refreshed.user_id,
            subscription_id = %refreshed.id,
            starts_at = %starts_at,
            ends_at = %ends_at,
            "Rolled free subscription window forward"
        );

        Ok(refreshed)
    }

    /// Pull Paddle's view of a lapsed paid subscription and converge the
    /// local row on it. Three outcomes:
    ///
    /// 1. Remote still grants access (current window, or status
    ///    active/trialing): adopt window/plan/status locally and return it.
    /// 2. Remote is gone (404) or reports no current access: expire the
    ///    local row and fall through to Free provisioning.
    /// 3. Any other gateway error propagates; the resolver fails closed.
    async fn reconcile_remote(
        &self,
        user_id: Uuid,
        subscription: Subscription,
        plan: Plan,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>> {
        let remote_id = match subscription.paddle_subscription_id.as_deref() {
            Some(id) => id,
            // Guarded by is_locally_managed() above; kept for safety.
            None => {
                let refreshed = self.roll_free_window(&subscription, now).await?;
                return Ok(Some(Entitlement {
                    subscription: refreshed,
                    plan,
                }));
            }
        };

        match self.paddle.get_subscription(remote_id).await {
            Ok(remote) if remote.covers(now) || remote.grants_access() => {
                let entitlement = self.adopt_remote(subscription, plan, &remote).await?;
                Ok(Some(entitlement))
            }
            Ok(remote) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    remote_status = %remote.status,
                    "Remote subscription no longer grants access; expiring local row"
                );
                self.expire_local(&subscription, &remote.status, now).await?;
                self.provision_free(user_id, now).await
            }
            Err(e) if e.is_provider_not_found() => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Remote subscription gone; expiring local row"
                );
                self.expire_local(&subscription, "canceled", now).await?;
                self.provision_free(user_id, now).await
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Reconciliation failed; refusing to grant entitlement"
                );
                Err(e)
            }
        }
    }

    /// Write Paddle's window/plan/status back onto the local row.
    ///
    /// The plan is resolved by the remote price id; when no local plan
    /// matches, the previous plan is kept as a safe default.
    async fn adopt_remote(
        &self,
        subscription: Subscription,
        current_plan: Plan,
        remote: &RemoteSubscription,
    ) -> BillingResult<Entitlement> {
        let plan = match remote.first_price_id() {
            Some(price_id) => self
                .plans
                .get_by_price_id(price_id)
                .await?
                .unwrap_or(current_plan),
            None => current_plan,
        };

        let (starts_at, ends_at) = match remote.current_period() {
            Some((starts_at, ends_at)) => (starts_at, Some(ends_at)),
            // No window reported: keep the original start, leave the
            // window open until the next webhook narrows it.
            None => (subscription.starts_at, None),
        };
        let status = local_status_for(&remote.status);
        let cancel_at = remote.cancel_effective_at();

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET plan_id = $1,
                status = $2,
                starts_at = $3,
                ends_at = $4,
                auto_renew = $5,
                cancel_at = $6,
                updated_at = NOW()
            WHERE id = $7
            RETURNING *
            "#,
        )
        .bind(plan.id)
        .bind(status)
        .bind(starts_at)
        .bind(ends_at)
        .bind(cancel_at.is_none())
        .bind(cancel_at)
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %updated.user_id,
            subscription_id = %updated.id,
            plan = %plan.name,
            status = %updated.status,
            ends_at = ?updated.ends_at,
            "Adopted remote subscription state"
        );

        if let Err(e) = self
            .event_logger
            .log(
                Some(updated.user_id),
                BillingEventType::SubscriptionReconciled,
                serde_json::json!({
                    "subscription_id": updated.id,
                    "paddle_subscription_id": remote.id,
                    "status": updated.status,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log reconciliation event");
        }

        Ok(Entitlement {
            subscription: updated,
            plan,
        })
    }

    /// Transition a no-longer-valid local row out of the active set,
    /// freezing its window. Never deletes.
    async fn expire_local(
        &self,
        subscription: &Subscription,
        remote_status: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let status = if remote_status == "paused" {
            "paused"
        } else {
            "canceled"
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1,
                auto_renew = FALSE,
                ends_at = COALESCE(ends_at, $2),
                cancel_at = COALESCE(cancel_at, ends_at, $2),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .event_logger
            .log(
                Some(subscription.user_id),
                BillingEventType::SubscriptionExpired,
                serde_json::json!({
                    "subscription_id": subscription.id,
                    "status": status,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log expiry event");
        }

        Ok(())
    }

    /// Provision the Free subscription for a user with no current
    /// entitlement, idempotently.
    ///
    /// A uniqueness violation on insert means a concurrent call already
    /// provisioned the row; the existing row is fetched and returned
    /// instead of erroring. Returns `Ok(None)` only when the Free plan is
    /// not seeded.
    async fn provision_free(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>> {
        let Some(free_plan) = self.plans.free_plan().await? else {
            tracing::error!(
                user_id = %user_id,
                "Free plan is not seeded; cannot provision entitlement"
            );
            return Ok(None);
        };

        let (starts_at, ends_at) = current_month_window(now)?;

        let inserted = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_id, status, starts_at, ends_at, auto_renew)
            VALUES ($1, $2, $3, 'active', $4, $5, FALSE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(free_plan.id)
        .bind(starts_at)
        .bind(ends_at)
        .fetch_one(&self.pool)
        .await
        .map_err(BillingError::from);

        let subscription = match inserted {
            Ok(subscription) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Provisioned free subscription"
                );
                if let Err(e) = self
                    .event_logger
                    .log(
                        Some(user_id),
                        BillingEventType::FreeProvisioned,
                        serde_json::json!({ "subscription_id": subscription.id }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log provisioning event");
                }
                subscription
            }
            Err(e) if e.is_unique_violation() => {
                // Another concurrent first-use call won the insert race.
                tracing::debug!(user_id = %user_id, "Free subscription already provisioned");
                self.fetch_current(user_id).await?.ok_or_else(|| {
                    BillingError::Conflict(
                        "subscription changed concurrently; retry the request".to_string(),
                    )
                })?
            }
            Err(e) => return Err(e),
        };

        let plan = self.plan_for(&subscription).await?;
        Ok(Some(Entitlement { subscription, plan }))
    }
}

/// Map a remote Paddle status onto the local status vocabulary.
fn local_status_for(remote_status: &str) -> &'static str {
    match remote_status {
        "active" => "active",
        "trialing" => "trialing",
        "paused" => "paused",
        _ => "canceled",
    }
}

/// The calendar-month window `[startOfMonth(now), startOfNextMonth(now))`
/// that free subscriptions roll through.
pub fn current_month_window(
    now: OffsetDateTime,
) -> BillingResult<(OffsetDateTime, OffsetDateTime)> {
    let start = Date::from_calendar_date(now.year(), now.month(), 1)?
        .midnight()
        .assume_utc();
    let (next_year, next_month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        month => (now.year(), month.next()),
    };
    let end = Date::from_calendar_date(next_year, next_month, 1)?
        .midnight()
        .assume_utc();
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use time::macros::datetime;

    #[test]
    fn month_window_covers_the_containing_month() {
        let (start, end) = current_month_window(datetime!(2025-06-15 13:45 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-06-01 00:00 UTC));
        assert_eq!(end, datetime!(2025-07-01 00:00 UTC));
    }

    #[test]
    fn month_window_rolls_over_the_year_boundary() {
        let (start, end) = current_month_window(datetime!(2025-12-31 23:59 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-12-01 00:00 UTC));
        assert_eq!(end, datetime!(2026-01-01 00:00 UTC));
    }

    #[test]
    fn month_window_at_exact_boundary() {
        let (start, end) = current_month_window(datetime!(2025-02-01 00:00 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-02-01 00:00 UTC));
        assert_eq!(end, datetime!(2025-03-01 00:00 UTC));
    }

    #[test]
    fn remote_status_maps_onto_local_vocabulary() {
        assert_eq!(local_status_for("active"), "active");
        assert_eq!(local_status_for("trialing"), "trialing");
        assert_eq!(local_status_for("paused"), "paused");
        assert_eq!(local_status_for("past_due"), "canceled");
        assert_eq!(local_status_for("canceled"), "canceled");
    }
}
