//! Lifecycle segment classification.
//!
//! `classify` is a pure function of a user snapshot and the evaluation time. It
//! is re-run before every dispatch, so it must never touch storage.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Segment, SubscriptionStatus, User};

/// Users not seen for longer than this are considered lapsed.
pub const INACTIVE_AFTER_DAYS: i64 = 7;

/// Map a user to the campaign segment they belong to, or `None` when no
/// lifecycle campaign applies (opted out or paying).
pub fn classify(user: &User, now: DateTime<Utc>) -> Option<Segment> {
    if user.marketing_opt_out {
        return None;
    }
    if !user.integration_connected {
        return Some(Segment::NotIntegrated);
    }
    if user.is_paid() {
        return None;
    }
    let inactive = user
        .last_seen_at
        .map(|seen| now - seen > Duration::days(INACTIVE_AFTER_DAYS))
        .unwrap_or(false);
    if inactive
        || matches!(
            user.subscription_status,
            SubscriptionStatus::Canceled | SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid
        )
    {
        return Some(Segment::Lapsed);
    }
    if user.subscription_status == SubscriptionStatus::Trialing {
        return Some(Segment::ActiveTrial);
    }
    // Connected but never started a trial.
    Some(Segment::Lapsed)
}
