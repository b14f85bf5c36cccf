//! Subscription storage.
//!
//! The [`SubscriptionStore`] trait is the single seam through which the
//! Matcher, the Dispatch Worker and the Callback Handler read and write
//! subscription state. Every method is one atomic read-then-write against the
//! store; the lease relies on this to guarantee at most one in-flight dispatch
//! per binding.
//!
//! # Implementations
//!
//! - [`SubscriptionDb`]: in-memory state, optionally persisted as an atomic
//!   JSON snapshot after every mutation (see [`snapshot`]).

use std::collections::BTreeSet;
use std::io;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    AuthToken, Binding, BindingId, Checkpoint, DeliveryMethod, Filter, FilterId, Frequency, Lease,
    LeaseHolder, Predicate, ResourceName, SubscriberId, Subscription, SubscriptionId, Trigger,
};

pub mod data;
pub mod db;
pub mod snapshot;

pub use data::StoreData;
pub use db::SubscriptionDb;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error while persisting or loading.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot on disk was written by an incompatible version.
    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,

    /// The binding does not exist.
    #[error("unknown binding: {0}")]
    UnknownBinding(BindingId),

    /// The filter does not exist.
    #[error("unknown filter: {0}")]
    UnknownFilter(FilterId),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A binding eligible for scheduling, pending the resource update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCandidate {
    pub binding: BindingId,
    pub resource: ResourceName,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseGrant {
    /// The binding was free and is now leased.
    Acquired,
    /// The binding held an expired lease, which was replaced.
    Reclaimed { previous: LeaseHolder },
    /// Another live lease holds the binding.
    Held,
    /// The binding no longer exists or was deleted.
    Gone,
}

/// Joined subscription/binding/filter state loaded by the Dispatch Worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchState {
    pub subscription: Subscription,
    pub binding: Binding,
    pub filter: Option<Filter>,
}

/// What the callback token authorizes: the binding it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub binding: BindingId,
    pub subscriber: SubscriberId,
    pub resource: ResourceName,
}

/// How a dispatch cycle ends. The token and lease are cleared with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Successful digest: move the checkpoint forward.
    Advance(Checkpoint),
    /// Failure: leave the checkpoint untouched.
    Retain,
    /// Failure with backoff: keep `last_check_time`, push `next_check_time` out.
    Defer { next_check_time: DateTime<Utc> },
}

/// Request to create a subscription with its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub subscriber: SubscriberId,
    pub frequency: Frequency,
    pub triggers: BTreeSet<Trigger>,
    pub methods: BTreeSet<DeliveryMethod>,
    pub filter_id: Option<FilterId>,
    /// `(resource, callback path)` pairs, one binding each.
    pub resources: Vec<(ResourceName, String)>,
}

/// Storage for subscriptions, bindings and filters.
pub trait SubscriptionStore: Send + Sync {
    /// Returns every binding that is schedulable at `now`, ignoring resource updates.
    ///
    /// Eligible bindings are not deleted, not leased (an expired lease counts as
    /// free), due by `next_check_time`, and owned by a live subscription whose
    /// frequency is not `never`.
    fn due_candidates(&self, now: DateTime<Utc>) -> Result<Vec<DueCandidate>>;

    /// Atomically leases the binding if it is free at `now`.
    fn acquire_lease(
        &self,
        binding: BindingId,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant>;

    /// Loads the joined state for a dispatch, or `None` if the binding is gone.
    fn load_dispatch_state(&self, binding: BindingId) -> Result<Option<DispatchState>>;

    /// Stores a freshly minted token for the cycle leased by `holder`.
    ///
    /// Returns false, storing nothing, when `holder` no longer owns the lease
    /// or the cycle already has a token.
    fn issue_token(
        &self,
        binding: BindingId,
        holder: LeaseHolder,
        token: AuthToken,
    ) -> Result<bool>;

    /// Ends the dispatch cycle leased by `holder`: clears token and lease and
    /// applies the completion.
    ///
    /// Returns false, changing nothing, when the lease was reclaimed by
    /// another holder in the meantime.
    fn finish_cycle(
        &self,
        binding: BindingId,
        holder: LeaseHolder,
        completion: Completion,
    ) -> Result<bool>;

    /// Resolves a callback token to the binding it currently authorizes.
    fn find_token(&self, token: &AuthToken) -> Result<Option<TokenGrant>>;

    /// Stores a filter and returns its id.
    fn add_filter(&self, predicates: Vec<Predicate>) -> Result<FilterId>;

    /// Creates a subscription and its bindings, checkpointed at `now`.
    fn subscribe(&self, request: NewSubscription, now: DateTime<Utc>) -> Result<SubscriptionId>;

    /// Soft-deletes a subscription and its bindings. Returns false if unknown.
    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<bool>;

    /// Returns a binding by id, including soft-deleted ones.
    fn binding(&self, binding: BindingId) -> Result<Option<Binding>>;

    /// Checks that the store can serve requests.
    fn ping(&self) -> Result<()>;
}
