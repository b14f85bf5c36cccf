//! In-memory store state and the pure operations over it.
//!
//! [`StoreData`] is what gets persisted; every [`SubscriptionStore`] method on
//! [`SubscriptionDb`](super::SubscriptionDb) is one call into this module while
//! the store lock is held.
//!
//! [`SubscriptionStore`]: super::SubscriptionStore

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Completion, DispatchState, DueCandidate, LeaseGrant, NewSubscription, Result, StoreError,
    TokenGrant,
};
use crate::types::{
    AuthToken, Binding, BindingId, Filter, FilterId, Lease, LeaseHolder, Predicate,
    Subscription, SubscriptionId,
};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Complete store state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    /// Next id to assign. Shared by subscriptions, bindings and filters.
    pub next_id: u64,

    pub subscriptions: BTreeMap<SubscriptionId, Subscription>,
    pub bindings: BTreeMap<BindingId, Binding>,
    pub filters: BTreeMap<FilterId, Filter>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreData {
    pub fn new() -> Self {
        StoreData {
            schema_version: SCHEMA_VERSION,
            next_id: 1,
            subscriptions: BTreeMap::new(),
            bindings: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Returns the live subscription owning `binding`, if any.
    fn live_owner(&self, binding: &Binding) -> Option<&Subscription> {
        if binding.deleted {
            return None;
        }
        self.subscriptions
            .get(&binding.subscription_id)
            .filter(|s| !s.deleted)
    }

    pub fn due_candidates(&self, now: DateTime<Utc>) -> Vec<DueCandidate> {
        self.bindings
            .values()
            .filter(|b| b.is_due(now) && !b.is_leased(now))
            .filter(|b| {
                self.live_owner(b)
                    .is_some_and(|s| s.frequency.is_schedulable())
            })
            .map(|b| DueCandidate {
                binding: b.id,
                resource: b.resource.clone(),
                last_check_time: b.last_check_time,
            })
            .collect()
    }

    pub fn acquire_lease(
        &mut self,
        id: BindingId,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> LeaseGrant {
        let live = self
            .bindings
            .get(&id)
            .is_some_and(|b| self.live_owner(b).is_some());
        if !live {
            return LeaseGrant::Gone;
        }
        let Some(binding) = self.bindings.get_mut(&id) else {
            return LeaseGrant::Gone;
        };

        let grant = match binding.lease {
            Some(existing) if !existing.is_expired(now) => return LeaseGrant::Held,
            Some(existing) => LeaseGrant::Reclaimed {
                previous: existing.holder,
            },
            None => LeaseGrant::Acquired,
        };

        // A reclaimed lease's token belongs to a cycle that is over.
        binding.auth_token = None;
        binding.lease = Some(lease);
        grant
    }

    pub fn load_dispatch_state(&self, id: BindingId) -> Option<DispatchState> {
        let binding = self.bindings.get(&id)?;
        let subscription = self.subscriptions.get(&binding.subscription_id)?;
        let filter = subscription
            .filter_id
            .and_then(|f| self.filters.get(&f))
            .cloned();
        Some(DispatchState {
            subscription: subscription.clone(),
            binding: binding.clone(),
            filter,
        })
    }

    /// Stores `token` for the cycle `holder` leases. Refused when another
    /// holder owns the lease or a token is already outstanding.
    pub fn issue_token(
        &mut self,
        id: BindingId,
        holder: LeaseHolder,
        token: AuthToken,
    ) -> Result<bool> {
        let binding = self
            .bindings
            .get_mut(&id)
            .ok_or(StoreError::UnknownBinding(id))?;
        if !binding.is_leased_by(holder) || binding.auth_token.is_some() {
            return Ok(false);
        }
        binding.auth_token = Some(token);
        Ok(true)
    }

    /// Ends the cycle `holder` leases. A holder whose lease was reclaimed
    /// changes nothing.
    pub fn finish_cycle(
        &mut self,
        id: BindingId,
        holder: LeaseHolder,
        completion: Completion,
    ) -> Result<bool> {
        let binding = self
            .bindings
            .get_mut(&id)
            .ok_or(StoreError::UnknownBinding(id))?;
        if !binding.is_leased_by(holder) {
            return Ok(false);
        }

        binding.auth_token = None;
        binding.lease = None;

        match completion {
            Completion::Advance(checkpoint) => {
                binding.last_check_time = checkpoint.last_check_time;
                binding.next_check_time = checkpoint.next_check_time;
            }
            Completion::Retain => {}
            Completion::Defer { next_check_time } => {
                binding.next_check_time = Some(
                    binding
                        .next_check_time
                        .map_or(next_check_time, |current| current.max(next_check_time)),
                );
            }
        }
        Ok(true)
    }

    pub fn find_token(&self, token: &AuthToken) -> Option<TokenGrant> {
        self.bindings
            .values()
            .filter(|b| b.auth_token.as_ref() == Some(token))
            .find_map(|b| {
                self.live_owner(b).map(|s| TokenGrant {
                    binding: b.id,
                    subscriber: s.subscriber,
                    resource: b.resource.clone(),
                })
            })
    }

    pub fn add_filter(&mut self, predicates: Vec<Predicate>) -> FilterId {
        let id = FilterId(self.allocate_id());
        self.filters.insert(id, Filter { id, predicates });
        id
    }

    pub fn subscribe(
        &mut self,
        request: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionId> {
        if let Some(filter_id) = request.filter_id
            && !self.filters.contains_key(&filter_id)
        {
            return Err(StoreError::UnknownFilter(filter_id));
        }

        let id = SubscriptionId(self.allocate_id());
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                subscriber: request.subscriber,
                frequency: request.frequency,
                triggers: request.triggers,
                methods: request.methods,
                filter_id: request.filter_id,
                deleted: false,
            },
        );

        for (resource, callback_path) in request.resources {
            let binding_id = BindingId(self.allocate_id());
            self.bindings.insert(
                binding_id,
                Binding {
                    id: binding_id,
                    subscription_id: id,
                    resource,
                    callback_path,
                    last_check_time: Some(now),
                    next_check_time: None,
                    lease: None,
                    auth_token: None,
                    deleted: false,
                },
            );
        }
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        subscription.deleted = true;

        for binding in self.bindings.values_mut() {
            if binding.subscription_id == id {
                binding.deleted = true;
                binding.auth_token = None;
            }
        }
        true
    }
}
