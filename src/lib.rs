//! Notify Digest - poll-based subscription digests.
//!
//! A periodic [`matcher::Matcher`] finds bindings whose resource changed since
//! their checkpoint, leases them and enqueues one job each. A pool of
//! [`dispatch::Dispatcher`] workers turns each job into an authorized callback
//! served by the [`callback::CallbackHandler`], which renders and delivers a
//! digest of the new and updated records. The checkpoint only moves forward
//! when that callback succeeds.

pub mod auth;
pub mod callback;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod matcher;
pub mod resource;
pub mod server;
pub mod store;
pub mod template;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
