//! Metered usage tracking and quota enforcement
//!
//! Two parallel meters (transcription minutes, document exports) share one
//! policy shape. `check_limit` reads, `validate` advises, `record`
//! enforces: the record path re-runs the check at write time instead of
//! trusting an earlier validate call.
//!
//! There is no atomic compare-and-insert across the ledger and the check,
//! so two concurrent requests from the same user can both pass and both
//! insert, briefly overshooting quota. That eventual-consistency window is
//! accepted; a hardened store-level conditional write would close it.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PaddleClient;
use crate::entitlement::{Entitlement, EntitlementService};
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

/// Which metered capability is being checked or recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Transcription,
    Export,
}

impl UsageKind {
    /// Unit noun for user-facing messages.
    pub fn unit(&self) -> &'static str {
        match self {
            UsageKind::Transcription => "transcription minutes",
            UsageKind::Export => "document exports",
        }
    }

    /// The plan allowance governing this meter; `None` = unlimited.
    pub fn plan_limit(&self, plan: &Plan) -> Option<i64> {
        match self {
            UsageKind::Transcription => plan.transcription_minutes.map(i64::from),
            UsageKind::Export => plan.export_limit.map(i64::from),
        }
    }

    fn sum_sql(&self) -> &'static str {
        match self {
            UsageKind::Transcription => {
                r#"
                SELECT COALESCE(SUM(minutes), 0) FROM transcription_usage
                WHERE user_id = $1
                  AND created_at >= $2
                  AND ($3::timestamptz IS NULL OR created_at < $3)
                "#
            }
            UsageKind::Export => {
                r#"
                SELECT COALESCE(SUM(quantity), 0) FROM export_usage
                WHERE user_id = $1
                  AND created_at >= $2
                  AND ($3::timestamptz IS NULL OR created_at < $3)
                "#
            }
        }
    }

    fn insert_sql(&self) -> &'static str {
        match self {
            UsageKind::Transcription => {
                "INSERT INTO transcription_usage (user_id, minutes, source) VALUES ($1, $2, $3)"
            }
            UsageKind::Export => {
                "INSERT INTO export_usage (user_id, quantity, format) VALUES ($1, $2, $3)"
            }
        }
    }
}

/// The effective window usage is aggregated over. An absent end means the
/// window is open and queried up to "now".
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
}

/// Snapshot of a user's standing against one meter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub allowed: bool,
    pub message: String,
    /// `None` = unlimited.
    pub remaining: Option<i64>,
    /// `None` = unlimited.
    pub plan_limit: Option<i64>,
    pub used: i64,
    pub window: Option<UsageWindow>,
    pub billing_interval: Option<String>,
}

impl LimitCheck {
    pub(crate) fn not_entitled() -> Self {
        Self {
            allowed: false,
            message: "An active subscription is required. Subscribe to get started.".to_string(),
            remaining: Some(0),
            plan_limit: Some(0),
            used: 0,
            window: None,
            billing_interval: None,
        }
    }

    pub(crate) fn unlimited(kind: UsageKind, billing_interval: Option<String>) -> Self {
        Self {
            allowed: true,
            message: format!("Your plan includes unlimited {}.", kind.unit()),
            remaining: None,
            plan_limit: None,
            used: 0,
            window: None,
            billing_interval,
        }
    }

    pub(crate) fn metered(
        kind: UsageKind,
        limit: i64,
        used: i64,
        window: UsageWindow,
        billing_interval: Option<String>,
    ) -> Self {
        let remaining = (limit - used).max(0);
        let (allowed, message) = if remaining > 0 {
            (
                true,
                format!(
                    "{remaining} of {limit} {} remaining this billing period.",
                    kind.unit()
                ),
            )
        } else {
            (
                false,
                format!(
                    "You have used all {limit} {} for this billing period. Upgrade your plan to continue.",
                    kind.unit()
                ),
            )
        };
        Self {
            allowed,
            message,
            remaining: Some(remaining),
            plan_limit: Some(limit),
            used,
            window: Some(window),
            billing_interval,
        }
    }
}

/// Outcome of an advisory validation ahead of a metered operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageValidation {
    pub allowed: bool,
    pub message: String,
    /// Non-blocking heads-up when the request eats most of the remaining
    /// quota.
    pub warning: Option<String>,
    pub limits: LimitCheck,
}

/// Quota policy over one pair of (entitlement resolver, usage ledger).
pub struct UsagePolicy {
    entitlements: EntitlementService,
    pool: PgPool,
}

impl UsagePolicy {
    pub fn new(paddle: PaddleClient, pool: PgPool) -> Self {
        let entitlements = EntitlementService::new(paddle, pool.clone());
        Self { entitlements, pool }
    }

    /// Compute the user's current standing for `kind`.
    ///
    /// Unlimited allowances return immediately without touching the usage
    /// ledger.
    pub async fn check_limit(&self, user_id: Uuid, kind: UsageKind) -> BillingResult<LimitCheck> {
        let Some(entitlement) = self
            .entitlements
            .ensure_active_subscription(user_id)
            .await?
        else {
            return Ok(LimitCheck::not_entitled());
        };

        let billing_interval = entitlement.plan.billing_interval.clone();
        let Some(limit) = kind.plan_limit(&entitlement.plan) else {
            return Ok(LimitCheck::unlimited(kind, billing_interval));
        };

        let window = effective_window(&entitlement);
        let used = self.sum_usage(user_id, kind, &window).await?;

        Ok(LimitCheck::metered(
            kind,
            limit,
            used,
            window,
            billing_interval,
        ))
    }

    /// Advisory pre-check for a requested quantity. Never writes.
    pub async fn validate(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        requested: i64,
    ) -> BillingResult<UsageValidation> {
        if requested <= 0 {
            return Err(BillingError::Validation(format!(
                "requested {} must be positive",
                kind.unit()
            )));
        }

        let limits = self.check_limit(user_id, kind).await?;

        if !limits.allowed {
            let message = limits.message.clone();
            return Ok(UsageValidation {
                allowed: false,
                message,
                warning: None,
                limits,
            });
        }

        match limits.remaining {
            Some(remaining) if requested > remaining => {
                let suggestion = if limits.billing_interval.is_none() {
                    "Upgrade to a paid plan for a higher allowance."
                } else {
                    "Upgrade your plan for a higher allowance."
                };
                let message = format!(
                    "Requested {requested} {} exceeds the {remaining} remaining. {suggestion}",
                    kind.unit()
                );
                Ok(UsageValidation {
                    allowed: false,
                    message,
                    warning: None,
                    limits,
                })
            }
            Some(remaining) => {
                let warning = exceeds_warning_threshold(requested, remaining).then(|| {
                    format!(
                        "This will use more than 80% of your remaining {}.",
                        kind.unit()
                    )
                });
                Ok(UsageValidation {
                    allowed: true,
                    message: limits.message.clone(),
                    warning,
                    limits,
                })
            }
            // Unlimited.
            None => Ok(UsageValidation {
                allowed: true,
                message: limits.message.clone(),
                warning: None,
                limits,
            }),
        }
    }

    /// Record usage after re-checking quota at write time.
    ///
    /// This is the enforcement boundary: `validate` is advisory, `record`
    /// is authoritative. Rejections carry the freshly computed limits so
    /// the caller can render remaining quota without another round-trip.
    pub async fn record(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        quantity: i64,
        detail: Option<&str>,
    ) -> BillingResult<LimitCheck> {
        if quantity <= 0 {
            return Err(BillingError::Validation(format!(
                "recorded {} must be positive",
                kind.unit()
            )));
        }

        let check = self.check_limit(user_id, kind).await?;
        if !check.allowed {
            return Err(BillingError::QuotaExceeded {
                check: Box::new(check),
            });
        }
        if let Some(remaining) = check.remaining {
            if quantity > remaining {
                return Err(BillingError::QuotaExceeded {
                    check: Box::new(check),
                });
            }
        }

        let quantity_i32 = i32::try_from(quantity)
            .map_err(|_| BillingError::Validation("quantity out of range".to_string()))?;
        sqlx::query(kind.insert_sql())
            .bind(user_id)
            .bind(quantity_i32)
            .bind(detail)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            user_id = %user_id,
            kind = ?kind,
            quantity,
            "Recorded metered usage"
        );

        // Fresh recomputation, not arithmetic on the stale check.
        self.check_limit(user_id, kind).await
    }

    async fn sum_usage(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        window: &UsageWindow,
    ) -> BillingResult<i64> {
        let used: i64 = sqlx::query_scalar(kind.sum_sql())
            .bind(user_id)
            .bind(window.starts_at)
            .bind(window.ends_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(used)
    }
}

/// Usage is matched to the effective window of the current subscription,
/// not to a foreign key, because a window can span subscription edits.
fn effective_window(entitlement: &Entitlement) -> UsageWindow {
    UsageWindow {
        starts_at: entitlement.subscription.starts_at,
        ends_at: entitlement.subscription.ends_at,
    }
}

/// True when `requested` exceeds 80% of `remaining`.
pub(crate) fn exceeds_warning_threshold(requested: i64, remaining: i64) -> bool {
    requested * 5 > remaining * 4
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use time::macros::datetime;

    fn window() -> UsageWindow {
        UsageWindow {
            starts_at: datetime!(2025-06-01 00:00 UTC),
            ends_at: Some(datetime!(2025-07-01 00:00 UTC)),
        }
    }

    #[test]
    fn metered_check_computes_remaining() {
        let check = LimitCheck::metered(
            UsageKind::Transcription,
            60,
            45,
            window(),
            Some("month".to_string()),
        );
        assert!(check.allowed);
        assert_eq!(check.remaining, Some(15));
        assert_eq!(check.plan_limit, Some(60));
        assert_eq!(check.used, 45);
    }

    #[test]
    fn metered_check_clamps_remaining_at_zero() {
        let check = LimitCheck::metered(UsageKind::Export, 10, 14, window(), None);
        assert!(!check.allowed);
        assert_eq!(check.remaining, Some(0));
        assert!(check.message.contains("used all 10"));
    }

    #[test]
    fn unlimited_check_skips_the_ledger() {
        let check = LimitCheck::unlimited(UsageKind::Export, Some("year".to_string()));
        assert!(check.allowed);
        assert_eq!(check.remaining, None);
        assert_eq!(check.plan_limit, None);
        assert_eq!(check.used, 0);
    }

    #[test]
    fn not_entitled_check_suggests_subscribing() {
        let check = LimitCheck::not_entitled();
        assert!(!check.allowed);
        assert!(check.message.contains("Subscribe"));
    }

    #[test]
    fn warning_threshold_is_80_percent_of_remaining() {
        // 15 requested of 15 remaining = 100% > 80%
        assert!(exceeds_warning_threshold(15, 15));
        // 12 of 15 = exactly 80%, not over
        assert!(!exceeds_warning_threshold(12, 15));
        assert!(exceeds_warning_threshold(13, 15));
        assert!(!exceeds_warning_threshold(1, 100));
    }

    #[test]
    fn plan_limits_map_per_kind() {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            upload_limit_mb: 500,
            transcription_minutes: Some(600),
            summarization_limit: None,
            export_limit: Some(50),
            billing_interval: Some("month".to_string()),
            paddle_price_id: Some("pri_pro".to_string()),
            premium_templates: true,
            archive_access: true,
            created_at: datetime!(2025-01-01 00:00 UTC),
            updated_at: datetime!(2025-01-01 00:00 UTC),
        };
        assert_eq!(UsageKind::Transcription.plan_limit(&plan), Some(600));
        assert_eq!(UsageKind::Export.plan_limit(&plan), Some(50));

        let mut unlimited = plan;
        unlimited.transcription_minutes = None;
        assert_eq!(UsageKind::Transcription.plan_limit(&unlimited), None);
    }
}
