// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Engine
//!
//! Tests critical boundary conditions in:
//! - Billing window arithmetic (ENT-W01 to ENT-W05)
//! - Quota evaluation (ENT-Q01 to ENT-Q07)
//! - Webhook signature verification (ENT-S01 to ENT-S06)
//! - Remote state adoption (ENT-R01 to ENT-R05)

#[cfg(test)]
mod window_tests {
    use crate::entitlement::current_month_window;
    use time::macros::datetime;

    // =========================================================================
    // ENT-W01: Mid-month instant - window is the containing calendar month
    // =========================================================================
    #[test]
    fn test_mid_month_window() {
        let (start, end) = current_month_window(datetime!(2025-06-15 13:45:12 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-06-01 00:00 UTC));
        assert_eq!(end, datetime!(2025-07-01 00:00 UTC));
    }

    // =========================================================================
    // ENT-W02: Last second of December - window rolls into the next year
    // =========================================================================
    #[test]
    fn test_december_rolls_into_next_year() {
        let (start, end) = current_month_window(datetime!(2025-12-31 23:59:59 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-12-01 00:00 UTC));
        assert_eq!(end, datetime!(2026-01-01 00:00 UTC));
    }

    // =========================================================================
    // ENT-W03: February in a leap year - 29-day window, correct boundaries
    // =========================================================================
    #[test]
    fn test_leap_year_february() {
        let (start, end) = current_month_window(datetime!(2024-02-29 08:00 UTC)).unwrap();
        assert_eq!(start, datetime!(2024-02-01 00:00 UTC));
        assert_eq!(end, datetime!(2024-03-01 00:00 UTC));
    }

    // =========================================================================
    // ENT-W04: Exactly at a month boundary - window starts at that instant
    // =========================================================================
    #[test]
    fn test_exact_month_boundary() {
        let (start, end) = current_month_window(datetime!(2025-09-01 00:00 UTC)).unwrap();
        assert_eq!(start, datetime!(2025-09-01 00:00 UTC));
        assert_eq!(end, datetime!(2025-10-01 00:00 UTC));
    }

    // =========================================================================
    // ENT-W05: Window start always precedes window end
    // =========================================================================
    #[test]
    fn test_window_is_ordered() {
        for month in 1..=12u8 {
            let now = time::Date::from_calendar_date(2025, time::Month::try_from(month).unwrap(), 15)
                .unwrap()
                .midnight()
                .assume_utc();
            let (start, end) = current_month_window(now).unwrap();
            assert!(start < end, "month {month} produced an unordered window");
            assert!(start <= now && now < end, "month {month} window misses now");
        }
    }
}

#[cfg(test)]
mod quota_tests {
    use crate::usage::{exceeds_warning_threshold, LimitCheck, UsageKind, UsageWindow};
    use time::macros::datetime;

    fn window() -> UsageWindow {
        UsageWindow {
            starts_at: datetime!(2025-06-01 00:00 UTC),
            ends_at: Some(datetime!(2025-07-01 00:00 UTC)),
        }
    }

    // =========================================================================
    // ENT-Q01: 60-minute plan with 45 used - 15 remaining, still allowed
    // =========================================================================
    #[test]
    fn test_partial_usage_remaining() {
        let check = LimitCheck::metered(
            UsageKind::Transcription,
            60,
            45,
            window(),
            Some("month".to_string()),
        );
        assert!(check.allowed);
        assert_eq!(check.remaining, Some(15));
    }

    // =========================================================================
    // ENT-Q02: Requesting 16 of 15 remaining - over quota
    // ENT-Q03: Requesting 15 of 15 remaining - allowed but over the 80% mark
    // =========================================================================
    #[test]
    fn test_boundary_between_reject_and_warn() {
        let remaining = 15;
        assert!(16 > remaining, "16 exceeds remaining and must be rejected");
        assert!(15 <= remaining, "15 fits in remaining");
        assert!(
            exceeds_warning_threshold(15, remaining),
            "15/15 is 100% of remaining and should warn"
        );
    }

    // =========================================================================
    // ENT-Q04: 80% exactly does not warn; one more unit does
    // =========================================================================
    #[test]
    fn test_warning_threshold_boundary() {
        assert!(!exceeds_warning_threshold(12, 15)); // exactly 80%
        assert!(exceeds_warning_threshold(13, 15));
        assert!(!exceeds_warning_threshold(80, 100));
        assert!(exceeds_warning_threshold(81, 100));
    }

    // =========================================================================
    // ENT-Q05: Usage at exactly the limit - zero remaining, rejected
    // =========================================================================
    #[test]
    fn test_exhausted_quota_rejected() {
        let check = LimitCheck::metered(
            UsageKind::Transcription,
            60,
            60,
            window(),
            Some("month".to_string()),
        );
        assert!(!check.allowed);
        assert_eq!(check.remaining, Some(0));
        assert!(check.message.contains("Upgrade"));
    }

    // =========================================================================
    // ENT-Q06: Usage beyond the limit (accepted race) - remaining clamps to 0
    // =========================================================================
    #[test]
    fn test_over_limit_clamps_to_zero() {
        let check = LimitCheck::metered(UsageKind::Export, 10, 13, window(), None);
        assert_eq!(check.remaining, Some(0));
        assert_eq!(check.used, 13);
    }

    // =========================================================================
    // ENT-Q07: Unlimited allowance - allowed with no counters
    // =========================================================================
    #[test]
    fn test_unlimited_reports_no_counters() {
        let check = LimitCheck::unlimited(UsageKind::Export, Some("year".to_string()));
        assert!(check.allowed);
        assert!(check.remaining.is_none());
        assert!(check.plan_limit.is_none());
        assert!(check.window.is_none());
    }
}

#[cfg(test)]
mod signature_tests {
    use crate::webhooks::verify_paddle_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use time::OffsetDateTime;

    const SECRET: &str = "pdl_ntfset_edge_case_secret";

    fn sign(secret: &str, ts: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{ts}:").as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // ENT-S01: Byte-for-byte-correct signature over "{ts}:{body}" passes
    // =========================================================================
    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"event_type":"subscription.updated","data":{"id":"sub_9"}}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, body));
        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_ok());
    }

    // =========================================================================
    // ENT-S02: Signature computed with the wrong secret fails
    // =========================================================================
    #[test]
    fn test_forged_signature_rejected() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("ts={};h1={}", ts, sign("attacker_secret", ts, body));
        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_err());
    }

    // =========================================================================
    // ENT-S03: Reordered header fields still parse (h1 before ts)
    // =========================================================================
    #[test]
    fn test_field_order_is_irrelevant() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("h1={};ts={}", sign(SECRET, ts, body), ts);
        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_ok());
    }

    // =========================================================================
    // ENT-S04: Truncated digest fails the exact-length comparison
    // =========================================================================
    #[test]
    fn test_truncated_digest_rejected() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let full = sign(SECRET, ts, body);
        let header = format!("ts={};h1={}", ts, &full[..full.len() - 2]);
        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_err());
    }

    // =========================================================================
    // ENT-S05: Timestamp far outside the 300s tolerance fails even when the
    // digest over it is correct
    // =========================================================================
    #[test]
    fn test_replayed_old_signature_rejected() {
        let body = b"{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp() - 3600;
        let header = format!("ts={};h1={}", ts, sign(SECRET, ts, body));
        assert!(verify_paddle_signature(SECRET, Some(&header), body).is_err());
    }

    // =========================================================================
    // ENT-S06: Garbage header structure fails without panicking
    // =========================================================================
    #[test]
    fn test_garbage_header_rejected() {
        for header in ["", ";;;", "ts=;h1=", "ts=abc;h1=def", "h1only", "=;="] {
            assert!(
                verify_paddle_signature(SECRET, Some(header), b"{}").is_err(),
                "header {header:?} should be rejected"
            );
        }
    }
}

#[cfg(test)]
mod remote_adoption_tests {
    use crate::client::RemoteSubscription;
    use time::macros::datetime;

    fn remote(json: &str) -> RemoteSubscription {
        serde_json::from_str(json).unwrap()
    }

    // =========================================================================
    // ENT-R01: The reference scenario - local ends_at lapsed, remote reports
    // an active window 30 days out; the remote state must be adoptable
    // =========================================================================
    #[test]
    fn test_lapsed_local_with_live_remote() {
        let sub = remote(
            r#"{
                "id": "sub_1",
                "status": "active",
                "current_billing_period": {
                    "starts_at": "2025-06-10T00:00:00Z",
                    "ends_at": "2025-07-10T00:00:00Z"
                },
                "items": [{"price": {"id": "pri_pro_month"}}]
            }"#,
        );
        let now = datetime!(2025-06-11 00:00 UTC);
        assert!(sub.covers(now));
        assert!(sub.grants_access());
        assert_eq!(sub.first_price_id(), Some("pri_pro_month"));
    }

    // =========================================================================
    // ENT-R02: Trialing status grants access even without a reported window
    // =========================================================================
    #[test]
    fn test_trialing_without_window_grants_access() {
        let sub = remote(r#"{"id": "sub_2", "status": "trialing"}"#);
        assert!(sub.grants_access());
        assert!(!sub.covers(datetime!(2025-06-11 00:00 UTC)));
    }

    // =========================================================================
    // ENT-R03: Canceled status with a lapsed window grants nothing
    // =========================================================================
    #[test]
    fn test_canceled_lapsed_remote_grants_nothing() {
        let sub = remote(
            r#"{
                "id": "sub_3",
                "status": "canceled",
                "current_billing_period": {
                    "starts_at": "2025-04-01T00:00:00Z",
                    "ends_at": "2025-05-01T00:00:00Z"
                }
            }"#,
        );
        let now = datetime!(2025-06-11 00:00 UTC);
        assert!(!sub.grants_access());
        assert!(!sub.covers(now));
    }

    // =========================================================================
    // ENT-R04: Items without prices are skipped when resolving the plan
    // =========================================================================
    #[test]
    fn test_price_resolution_skips_priceless_items() {
        let sub = remote(
            r#"{
                "id": "sub_4",
                "status": "active",
                "items": [{}, {"price": {"id": "pri_team_year"}}]
            }"#,
        );
        assert_eq!(sub.first_price_id(), Some("pri_team_year"));
    }

    // =========================================================================
    // ENT-R05: Only a scheduled change with action "cancel" carries a
    // cancellation date
    // =========================================================================
    #[test]
    fn test_only_cancel_actions_produce_cancel_dates() {
        let cancel = remote(
            r#"{
                "id": "sub_5",
                "status": "active",
                "scheduled_change": {"action": "cancel", "effective_at": "2025-07-01T00:00:00Z"}
            }"#,
        );
        assert!(cancel.cancel_effective_at().is_some());

        let pause = remote(
            r#"{
                "id": "sub_6",
                "status": "active",
                "scheduled_change": {"action": "pause", "effective_at": "2025-07-01T00:00:00Z"}
            }"#,
        );
        assert!(pause.cancel_effective_at().is_none());
    }
}
