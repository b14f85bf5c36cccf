//! Subscription, binding and filter records.
//!
//! A [`Subscription`] owns one or more [`Binding`]s, each tracking its own
//! checkpoint and lease for one monitored resource.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{
    AuthToken, BindingId, FilterId, LeaseHolder, ResourceName, SubscriberId, SubscriptionId,
};
use super::lease::Lease;

/// How often a subscriber wants to receive digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Never notify. Permanently excluded from scheduling.
    Never,
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    /// Minimum time between two successful digests, or `None` for `Never`.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Frequency::Never => None,
            Frequency::Hourly => Some(Duration::minutes(60)),
            Frequency::Daily => Some(Duration::minutes(1440)),
            Frequency::Weekly => Some(Duration::minutes(10080)),
        }
    }

    pub fn is_schedulable(&self) -> bool {
        !matches!(self, Frequency::Never)
    }
}

/// Which kind of change causes a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Trigger {
    /// Records created since the checkpoint.
    #[serde(rename = "new")]
    New,
    /// Records modified since the checkpoint.
    #[serde(rename = "upd")]
    Updated,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::New => f.write_str("new"),
            Trigger::Updated => f.write_str("upd"),
        }
    }
}

/// A delivery channel a subscriber can be reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Email,
    Sms,
    Twitter,
}

impl DeliveryMethod {
    pub const ALL: [DeliveryMethod; 3] = [
        DeliveryMethod::Email,
        DeliveryMethod::Sms,
        DeliveryMethod::Twitter,
    ];

    /// Lowercase name used in template file names (`notify_<name>.html`).
    pub fn template_name(&self) -> &'static str {
        match self {
            DeliveryMethod::Email => "email",
            DeliveryMethod::Sms => "sms",
            DeliveryMethod::Twitter => "twitter",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMethod::Email => f.write_str("EMAIL"),
            DeliveryMethod::Sms => f.write_str("SMS"),
            DeliveryMethod::Twitter => f.write_str("TWITTER"),
        }
    }
}

/// A subscriber's standing interest in changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: SubscriberId,
    pub frequency: Frequency,
    pub triggers: BTreeSet<Trigger>,
    pub methods: BTreeSet<DeliveryMethod>,
    pub filter_id: Option<FilterId>,
    #[serde(default)]
    pub deleted: bool,
}

/// One stored predicate: a field name and an optional value.
///
/// Predicates with no value are ignored when building the callback query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub value: Option<String>,
}

impl Predicate {
    pub fn new(field: impl Into<String>, value: Option<&str>) -> Self {
        Predicate {
            field: field.into(),
            value: value.map(str::to_string),
        }
    }
}

/// A reusable filter referenced by subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub id: FilterId,
    pub predicates: Vec<Predicate>,
}

/// The pairing of a subscription with one monitored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub subscription_id: SubscriptionId,
    pub resource: ResourceName,
    /// Path appended to the callback base URL.
    pub callback_path: String,
    pub last_check_time: Option<DateTime<Utc>>,
    pub next_check_time: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub auth_token: Option<AuthToken>,
    #[serde(default)]
    pub deleted: bool,
}

impl Binding {
    /// Returns true if a lease is held and has not expired at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Returns true if `holder` owns the current lease, expired or not.
    pub fn is_leased_by(&self, holder: LeaseHolder) -> bool {
        self.lease.as_ref().is_some_and(|l| l.holder == holder)
    }

    /// Returns true if the binding's own schedule allows a check at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_time.is_none_or(|next| next <= now)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_check_time: self.last_check_time,
            next_check_time: self.next_check_time,
        }
    }
}

/// The `last_check_time` / `next_check_time` pair tracking notification progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_check_time: Option<DateTime<Utc>>,
    pub next_check_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Checkpoint after a successful digest at `now`.
    pub fn advanced(now: DateTime<Utc>, interval: Duration) -> Self {
        Checkpoint {
            last_check_time: Some(now),
            next_check_time: Some(now + interval),
        }
    }
}

/// Encodes a timestamp as ISO-8601 UTC with second precision (`2024-01-15T12:00:00Z`).
pub fn encode_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Decodes an ISO-8601 timestamp with an explicit offset into UTC.
pub fn decode_iso(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
