//! Billing Invariants Module
//!
//! Runnable consistency checks over subscription and usage state. These can
//! be run after any mutation or webhook burst to confirm the system is in a
//! valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations include enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlement may be granted or denied incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for canceled without ends_at violation
#[derive(Debug, sqlx::FromRow)]
struct CanceledNoEndRow {
    sub_id: Uuid,
    user_id: Uuid,
    status: String,
}

/// Row type for paid subscription without remote counterpart
#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutRemoteRow {
    sub_id: Uuid,
    user_id: Uuid,
    plan_name: String,
}

/// Row type for free subscription with auto-renew set
#[derive(Debug, sqlx::FromRow)]
struct FreeAutoRenewRow {
    sub_id: Uuid,
    user_id: Uuid,
}

/// Row type for subscriptions referencing missing plans
#[derive(Debug, sqlx::FromRow)]
struct OrphanPlanRow {
    sub_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
}

/// Row type for non-positive usage quantities
#[derive(Debug, sqlx::FromRow)]
struct NonPositiveUsageRow {
    user_id: Uuid,
    table_name: String,
    bad_rows: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_canceled_has_ends_at().await?);
        violations.extend(self.check_paid_has_remote_counterpart().await?);
        violations.extend(self.check_free_never_auto_renews().await?);
        violations.extend(self.check_subscription_plan_exists().await?);
        violations.extend(self.check_usage_quantities_positive().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 active/trialing subscription per user
    ///
    /// Multiple entitlement-bearing rows would make quota evaluation and
    /// billing operations ambiguous; the resolver picks deterministically
    /// but duplicates should never persist.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} entitlement-bearing subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Canceled subscriptions have a frozen `ends_at`
    ///
    /// Without it there is no record of when access actually ended.
    async fn check_canceled_has_ends_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoEndRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id, status
            FROM subscriptions
            WHERE status = 'canceled' AND ends_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_ends_at".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no ends_at date".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Paid-plan subscriptions carry a Paddle subscription id
    ///
    /// A paid row without a remote counterpart can never be reconciled and
    /// will grant access forever.
    async fn check_paid_has_remote_counterpart(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutRemoteRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, p.name as plan_name
            FROM subscriptions s
            JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.status IN ('active', 'trialing')
              AND p.billing_interval IS NOT NULL
              AND s.paddle_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_remote_counterpart".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription on paid plan '{}' has no Paddle subscription id",
                    row.plan_name
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "plan": row.plan_name,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Locally-managed rows never auto-renew
    ///
    /// The free window self-renews by rolling forward; an `auto_renew`
    /// flag on it indicates a broken write path.
    async fn check_free_never_auto_renews(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FreeAutoRenewRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE paddle_subscription_id IS NULL AND auto_renew = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_never_auto_renews".to_string(),
                user_ids: vec![row.user_id],
                description: "Locally-managed subscription has auto_renew set".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Every subscription references an existing plan
    async fn check_subscription_plan_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPlanRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, s.plan_id
            FROM subscriptions s
            LEFT JOIN subscription_plans p ON p.id = s.plan_id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_plan_exists".to_string(),
                user_ids: vec![row.user_id],
                description: "Subscription references a plan that does not exist".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "plan_id": row.plan_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Usage ledgers contain only positive quantities
    ///
    /// The ledgers are append-only; a zero or negative row means the write
    /// path's validation was bypassed.
    async fn check_usage_quantities_positive(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NonPositiveUsageRow> = sqlx::query_as(
            r#"
            SELECT user_id, 'transcription_usage' as table_name, COUNT(*) as bad_rows
            FROM transcription_usage
            WHERE minutes <= 0
            GROUP BY user_id
            UNION ALL
            SELECT user_id, 'export_usage' as table_name, COUNT(*) as bad_rows
            FROM export_usage
            WHERE quantity <= 0
            GROUP BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_quantities_positive".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "{} non-positive rows in {}",
                    row.bad_rows, row.table_name
                ),
                context: serde_json::json!({
                    "table": row.table_name,
                    "rows": row.bad_rows,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "canceled_has_ends_at" => self.check_canceled_has_ends_at().await,
            "paid_has_remote_counterpart" => self.check_paid_has_remote_counterpart().await,
            "free_never_auto_renews" => self.check_free_never_auto_renews().await,
            "subscription_plan_exists" => self.check_subscription_plan_exists().await,
            "usage_quantities_positive" => self.check_usage_quantities_positive().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "canceled_has_ends_at",
            "paid_has_remote_counterpart",
            "free_never_auto_renews",
            "subscription_plan_exists",
            "usage_quantities_positive",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"paid_has_remote_counterpart"));
    }
}
