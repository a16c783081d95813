//! Core billing vocabulary shared across crates.
//!
//! Subscription rows store these values as lowercase text columns, so every
//! enum here round-trips through `as_str`/`parse_str` rather than a custom
//! Postgres type.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a subscription row.
///
/// `Active` and `Trialing` grant entitlement and allow billing operations.
/// `Paused` and `Canceled` are terminal for entitlement purposes; rows are
/// never deleted, only transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "paused" => Some(SubscriptionStatus::Paused),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Statuses that grant entitlement and permit billing operations.
    pub fn is_manageable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval of a paid plan. Free plans have no interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "month" | "monthly" => Some(BillingInterval::Month),
            "year" | "annual" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a plan change is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationMode {
    /// Charge the prorated difference now and switch immediately.
    Immediate,
    /// Schedule the new plan to take effect at the next renewal.
    NextBillingPeriod,
}

impl ProrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationMode::Immediate => "immediate",
            ProrationMode::NextBillingPeriod => "next_billing_period",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(SubscriptionStatus::parse_str(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse_str("past_due"), None);
    }

    #[test]
    fn manageable_statuses() {
        assert!(SubscriptionStatus::Active.is_manageable());
        assert!(SubscriptionStatus::Trialing.is_manageable());
        assert!(!SubscriptionStatus::Paused.is_manageable());
        assert!(!SubscriptionStatus::Canceled.is_manageable());
    }

    #[test]
    fn interval_accepts_provider_aliases() {
        assert_eq!(
            BillingInterval::parse_str("monthly"),
            Some(BillingInterval::Month)
        );
        assert_eq!(
            BillingInterval::parse_str("annual"),
            Some(BillingInterval::Year)
        );
        assert_eq!(BillingInterval::parse_str("weekly"), None);
    }
}
