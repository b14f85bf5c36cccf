//! Time-bounded leases on bindings.
//!
//! A lease replaces a bare `locked` flag: it names its holder and expires, so a
//! dispatch that never returns cannot keep a binding locked forever. Once
//! `expires_at` has passed the Matcher may reclaim the binding.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::LeaseHolder;

/// An exclusive claim on a binding for one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: LeaseHolder,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Grants a new lease valid for `ttl` from `now`.
    pub fn grant(now: DateTime<Utc>, ttl: Duration) -> Self {
        Lease {
            holder: LeaseHolder::generate(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
