use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::None => "none",
        }
    }

    /// Unknown values are treated as "no subscription".
    pub fn parse(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            _ => SubscriptionStatus::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Paid,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paid" => SubscriptionTier::Paid,
            _ => SubscriptionTier::Free,
        }
    }
}

/// Snapshot of the user attributes the mailer cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub integration_connected: bool,
    pub subscription_status: SubscriptionStatus,
    pub subscription_tier: SubscriptionTier,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub marketing_opt_out: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: i64, email: Option<&str>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            email: email.map(str::to_string),
            display_name: None,
            integration_connected: false,
            subscription_status: SubscriptionStatus::None,
            subscription_tier: SubscriptionTier::Free,
            last_seen_at: Some(created_at),
            marketing_opt_out: false,
            created_at,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self.subscription_tier == SubscriptionTier::Paid
    }

    /// Non-empty contact address, if any.
    pub fn contact_address(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Partial update applied by `db::update_user`. `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub integration_connected: Option<bool>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_tier: Option<SubscriptionTier>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub marketing_opt_out: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Segment {
    NotIntegrated,
    ActiveTrial,
    Lapsed,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::NotIntegrated, Segment::ActiveTrial, Segment::Lapsed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::NotIntegrated => "not-integrated",
            Segment::ActiveTrial => "active-trial",
            Segment::Lapsed => "lapsed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Segment::ALL.into_iter().find(|seg| seg.as_str() == s)
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One message of a segment's sequence.
    Step,
    /// Single notification tied to a business entity.
    OneShot,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Step => "step",
            JobKind::OneShot => "one_shot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "step" => Some(JobKind::Step),
            "one_shot" => Some(JobKind::OneShot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sent,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Sent => "sent",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "sent" => Some(JobStatus::Sent),
            "cancelled" => Some(JobStatus::Cancelled),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub kind: JobKind,
    pub segment: Option<Segment>,
    pub step_label: Option<String>,
    pub step_ordinal: Option<u32>,
    /// Template id for one-shot jobs; step jobs resolve theirs from the catalog.
    pub template: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub dedupe_key: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub metadata: Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Worker holding the current lease, if any.
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for `db::create_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: i64,
    pub kind: JobKind,
    pub segment: Option<Segment>,
    pub step_label: Option<String>,
    pub step_ordinal: Option<u32>,
    pub template: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub dedupe_key: String,
    pub metadata: Value,
}

/// Partial update for a pending job. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: Option<Value>,
}

impl JobUpdate {
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Sent),
            sent_at: Some(at),
            ..Default::default()
        }
    }

    pub fn cancelled(reason: &str) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            last_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn deferred(until: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(until),
            ..Default::default()
        }
    }
}

/// Dedupe key of a sequenced step job.
pub fn step_dedupe_key(user_id: i64, segment: Segment, step_label: &str) -> String {
    format!("campaign:{}:{}:{}", user_id, segment.as_str(), step_label)
}

/// Dedupe key of a one-shot job tied to a business entity.
pub fn one_shot_dedupe_key(user_id: i64, kind: &str, entity_id: &str) -> String {
    format!("oneshot:{}:{}:{}", user_id, kind, entity_id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    InApp,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(NotificationChannel::Email),
            "in_app" => Some(NotificationChannel::InApp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// Outbox row for a one-shot notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxNotification {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    /// Raw channel as stored; unknown channels are rejected at dispatch time.
    pub channel: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub dedupe_key: String,
    pub status: NotificationStatus,
    pub reason: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub kind: String,
    pub channel: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    /// Derived from `(user_id, kind, title)` when absent.
    pub dedupe_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl NewNotification {
    pub fn effective_dedupe_key(&self) -> String {
        self.dedupe_key.clone().unwrap_or_else(|| {
            format!("notification:{}:{}:{}", self.user_id, self.kind, self.title)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in [
            JobStatus::Pending,
            JobStatus::Sent,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
        assert_eq!(Segment::parse("active-trial"), Some(Segment::ActiveTrial));
        assert_eq!(Segment::parse("paid"), None);
    }

    #[test]
    fn unknown_subscription_values_fall_back() {
        assert_eq!(SubscriptionStatus::parse("incomplete"), SubscriptionStatus::None);
        assert_eq!(SubscriptionTier::parse("enterprise"), SubscriptionTier::Free);
    }

    #[test]
    fn dedupe_keys_are_deterministic() {
        assert_eq!(
            step_dedupe_key(7, Segment::Lapsed, "lapsed-2"),
            "campaign:7:lapsed:lapsed-2"
        );
        assert_eq!(
            one_shot_dedupe_key(7, "payment_failed", "inv_42"),
            "oneshot:7:payment_failed:inv_42"
        );
    }

    #[test]
    fn blank_email_is_not_a_contact_address() {
        let mut user = User::new(1, Some("  "), Utc::now());
        assert!(user.contact_address().is_none());
        user.email = Some("runner@example.com".into());
        assert_eq!(user.contact_address(), Some("runner@example.com"));
    }
}
