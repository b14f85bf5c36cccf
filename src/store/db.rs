//! The default [`SubscriptionStore`]: a mutex-guarded [`StoreData`] with
//! optional snapshot persistence.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::data::StoreData;
use super::snapshot::{save_snapshot_atomic, try_load_snapshot};
use super::{
    Completion, DispatchState, DueCandidate, LeaseGrant, NewSubscription, Result, StoreError,
    SubscriptionStore, TokenGrant,
};
use crate::types::{
    AuthToken, Binding, BindingId, FilterId, Lease, LeaseHolder, Predicate, SubscriptionId,
};

/// Subscription store backed by memory and, optionally, a JSON snapshot file.
///
/// Mutations run against a copy of the state; the copy is persisted and only
/// then swapped in. A failed write therefore leaves both the file and the
/// in-memory state as they were.
#[derive(Debug)]
pub struct SubscriptionDb {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
}

impl SubscriptionDb {
    /// Creates a store that keeps everything in memory.
    pub fn in_memory() -> Self {
        SubscriptionDb {
            data: Mutex::new(StoreData::new()),
            path: None,
        }
    }

    /// Opens the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match try_load_snapshot(&path)? {
            Some(data) => {
                info!(
                    path = %path.display(),
                    subscriptions = data.subscriptions.len(),
                    bindings = data.bindings.len(),
                    "loaded subscription store"
                );
                data
            }
            None => {
                info!(path = %path.display(), "starting with empty subscription store");
                StoreData::new()
            }
        };
        Ok(SubscriptionDb {
            data: Mutex::new(data),
            path: Some(path),
        })
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> Result<StoreData> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    /// Applies `f` to a copy of the state, persists it, and commits it.
    ///
    /// If `f` fails nothing is written.
    fn write<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        if next != *guard {
            if let Some(path) = &self.path {
                save_snapshot_atomic(path, &next)?;
                debug!(path = %path.display(), "persisted subscription store");
            }
            *guard = next;
        }
        Ok(value)
    }
}

impl SubscriptionStore for SubscriptionDb {
    fn due_candidates(&self, now: DateTime<Utc>) -> Result<Vec<DueCandidate>> {
        self.read(|d| d.due_candidates(now))
    }

    fn acquire_lease(
        &self,
        binding: BindingId,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant> {
        self.write(|d| Ok(d.acquire_lease(binding, lease, now)))
    }

    fn load_dispatch_state(&self, binding: BindingId) -> Result<Option<DispatchState>> {
        self.read(|d| d.load_dispatch_state(binding))
    }

    fn issue_token(
        &self,
        binding: BindingId,
        holder: LeaseHolder,
        token: AuthToken,
    ) -> Result<bool> {
        self.write(|d| d.issue_token(binding, holder, token))
    }

    fn finish_cycle(
        &self,
        binding: BindingId,
        holder: LeaseHolder,
        completion: Completion,
    ) -> Result<bool> {
        self.write(|d| d.finish_cycle(binding, holder, completion))
    }

    fn find_token(&self, token: &AuthToken) -> Result<Option<TokenGrant>> {
        self.read(|d| d.find_token(token))
    }

    fn add_filter(&self, predicates: Vec<Predicate>) -> Result<FilterId> {
        self.write(|d| Ok(d.add_filter(predicates)))
    }

    fn subscribe(&self, request: NewSubscription, now: DateTime<Utc>) -> Result<SubscriptionId> {
        self.write(|d| d.subscribe(request, now))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<bool> {
        self.write(|d| Ok(d.unsubscribe(subscription)))
    }

    fn binding(&self, binding: BindingId) -> Result<Option<Binding>> {
        self.read(|d| d.bindings.get(&binding).cloned())
    }

    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
