//! The Dispatch Worker: runs one callback exchange per leased binding.
//!
//! A job names a binding the Matcher has already leased. The worker mints a
//! fresh token, persists it, calls back into the service with the binding's
//! filter and checkpoint encoded in the URL, and then ends the cycle: the
//! token and lease are cleared, and the checkpoint advances only if the
//! callback reported success.
//!
//! Every store write is made on behalf of the lease holder the job was
//! scheduled under. Once that lease is reclaimed the worker can neither issue
//! a token nor end the newer cycle.
//!
//! Jobs are delivered at least once. A job whose binding is gone or whose
//! cycle is not available to it is a no-op, so duplicates are harmless.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::auth::SignedIdentity;
use crate::callback::{CallbackBody, FORMAT_PARAM, MESSAGE_FORMAT, TOKEN_PARAM};
use crate::clock::Clock;
use crate::matcher::DispatchJob;
use crate::resource::{CREATED_ON, FieldFilter, FilterOp, MODIFIED_ON, ResourceCatalog};
use crate::store::{Completion, DispatchState, StoreError, SubscriptionStore};
use crate::types::{AuthToken, BindingId, Checkpoint, Trigger, encode_iso};

pub mod callback;
pub mod pool;


pub use callback::{
    CallbackClient, CallbackError, CallbackErrorKind, CallbackRequest,
    DEFAULT_CALLBACK_TIMEOUT_SECS, ReqwestCallbackClient, interpret_response,
};
pub use pool::spawn_workers;

/// Why a dispatch cycle failed.
#[derive(Debug, Error)]
pub enum DispatchFailure {
    #[error("callback failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The callback path cannot be appended to the base URL.
    #[error("invalid callback URL: {0}")]
    Url(String),

    /// The lease expired and was reclaimed while the callback ran; the
    /// checkpoint belongs to the newer cycle.
    #[error("lease reclaimed before the cycle finished")]
    LeaseLost,
}

/// Why a job was dropped without a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The binding does not exist.
    Missing,
    /// The binding holds no lease; the job is a duplicate.
    NotLeased,
    /// The binding or its subscription was deleted.
    Deleted,
    /// Another worker already holds the token for this lease.
    InFlight,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Missing => f.write_str("binding not found"),
            SkipReason::NotLeased => f.write_str("binding not leased"),
            SkipReason::Deleted => f.write_str("subscription deleted"),
            SkipReason::InFlight => f.write_str("cycle already in flight"),
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The callback succeeded and the checkpoint advanced.
    Delivered { message: String },
    /// The cycle failed; the checkpoint was retained or deferred.
    Failed(DispatchFailure),
    Skipped(SkipReason),
}

/// Result of one [`Dispatcher::dispatch`] call.
#[derive(Debug)]
pub struct DispatchReport {
    pub binding: BindingId,
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    fn new(binding: BindingId, outcome: DispatchOutcome) -> Self {
        DispatchReport { binding, outcome }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Delivered { .. })
    }

    /// Human-readable outcome.
    pub fn message(&self) -> String {
        match &self.outcome {
            DispatchOutcome::Delivered { message } => message.clone(),
            DispatchOutcome::Failed(e) => e.to_string(),
            DispatchOutcome::Skipped(reason) => reason.to_string(),
        }
    }
}

/// Settings of the Dispatch Worker.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Endpoint callback paths are appended to.
    pub base_url: Url,
    /// When set, a failed cycle pushes `next_check_time` at least this far out.
    pub failure_backoff: Option<Duration>,
}

impl DispatchConfig {
    pub fn new(base_url: Url) -> Self {
        DispatchConfig {
            base_url,
            failure_backoff: None,
        }
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = Some(backoff);
        self
    }
}

/// Executes dispatch jobs.
pub struct Dispatcher<C> {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn ResourceCatalog>,
    client: C,
    identity: SignedIdentity,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
}

impl<C: CallbackClient> Dispatcher<C> {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn ResourceCatalog>,
        client: C,
        identity: SignedIdentity,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Dispatcher {
            store,
            catalog,
            client,
            identity,
            config,
            clock,
        }
    }

    /// Runs one dispatch cycle. Never fails: every path ends in a report.
    #[instrument(skip_all, fields(binding = %job.binding))]
    pub async fn dispatch(&self, job: DispatchJob) -> DispatchReport {
        let binding = job.binding;
        let now = self.clock.now();

        let state = match self.store.load_dispatch_state(binding) {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("dropping job for unknown binding");
                return DispatchReport::new(binding, DispatchOutcome::Skipped(SkipReason::Missing));
            }
            Err(e) => {
                error!(error = %e, "failed to load binding");
                return DispatchReport::new(binding, DispatchOutcome::Failed(e.into()));
            }
        };

        let Some(holder) = state.binding.lease.map(|lease| lease.holder) else {
            debug!("dropping duplicate job");
            return DispatchReport::new(binding, DispatchOutcome::Skipped(SkipReason::NotLeased));
        };
        if state.binding.deleted || state.subscription.deleted {
            debug!("releasing lease of deleted binding");
            if let Err(e) = self.store.finish_cycle(binding, holder, Completion::Retain) {
                error!(error = %e, "failed to release lease");
            }
            return DispatchReport::new(binding, DispatchOutcome::Skipped(SkipReason::Deleted));
        }

        let token = AuthToken::generate();
        let result = match self.store.issue_token(binding, holder, token.clone()) {
            Ok(true) => self.exchange(&state, &token).await,
            Ok(false) => {
                debug!(holder = %holder, "dropping job for a cycle already in flight");
                return DispatchReport::new(binding, DispatchOutcome::Skipped(SkipReason::InFlight));
            }
            Err(e) => Err(e.into()),
        };
        let completion = self.completion(&state, &result, now);

        match self.store.finish_cycle(binding, holder, completion) {
            Ok(true) => {}
            Ok(false) => {
                warn!(holder = %holder, "lease was reclaimed before the cycle finished");
                return DispatchReport::new(
                    binding,
                    DispatchOutcome::Failed(DispatchFailure::LeaseLost),
                );
            }
            Err(e) => {
                error!(error = %e, "failed to finish dispatch cycle");
                return DispatchReport::new(binding, DispatchOutcome::Failed(e.into()));
            }
        }

        let outcome = match result {
            Ok(message) => {
                info!(resource = %state.binding.resource, message = %message, "digest delivered");
                DispatchOutcome::Delivered { message }
            }
            Err(e) => {
                log_failure(&e, &completion);
                DispatchOutcome::Failed(e)
            }
        };
        DispatchReport::new(binding, outcome)
    }

    /// Performs the callback with an issued token.
    async fn exchange(
        &self,
        state: &DispatchState,
        token: &AuthToken,
    ) -> Result<String, DispatchFailure> {
        let request = self.build_request(state, token)?;
        let response = self.client.post(request).await?;
        if response.is_success() {
            Ok(response.message)
        } else {
            Err(CallbackError::Rejected(response.message).into())
        }
    }

    fn completion(
        &self,
        state: &DispatchState,
        result: &Result<String, DispatchFailure>,
        now: DateTime<Utc>,
    ) -> Completion {
        match (result, self.config.failure_backoff) {
            (Ok(_), _) => Completion::Advance(match state.subscription.frequency.interval() {
                Some(interval) => Checkpoint::advanced(now, interval),
                None => Checkpoint {
                    last_check_time: Some(now),
                    next_check_time: None,
                },
            }),
            (Err(_), Some(backoff)) => Completion::Defer {
                next_check_time: now + backoff,
            },
            (Err(_), None) => Completion::Retain,
        }
    }

    /// Builds the callback URL, headers and body for `state`.
    pub fn build_request(
        &self,
        state: &DispatchState,
        token: &AuthToken,
    ) -> Result<CallbackRequest, DispatchFailure> {
        let binding = &state.binding;
        let subscription = &state.subscription;
        let resource = &binding.resource;

        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DispatchFailure::Url(self.config.base_url.to_string()))?
            .pop_if_empty()
            .extend(binding.callback_path.split('/').filter(|s| !s.is_empty()));

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(TOKEN_PARAM, token.as_str())
                .append_pair(FORMAT_PARAM, MESSAGE_FORMAT);

            if let Some(checkpoint) = binding.last_check_time {
                let field = if subscription.triggers.contains(&Trigger::Updated) {
                    MODIFIED_ON
                } else {
                    CREATED_ON
                };
                let bound = FieldFilter::new(
                    self.catalog.prefix_selector(resource, field),
                    FilterOp::Ge,
                    encode_iso(checkpoint),
                );
                let (key, value) = bound.to_param();
                query.append_pair(&key, &value);
            }

            let predicates = state.filter.iter().flat_map(|f| &f.predicates);
            for predicate in predicates {
                if let Some(value) = &predicate.value {
                    let selector = self.catalog.prefix_selector(resource, &predicate.field);
                    query.append_pair(&selector, value);
                }
            }
        }

        Ok(CallbackRequest {
            url,
            headers: self.identity.headers_for(subscription.subscriber).to_vec(),
            body: CallbackBody {
                pe_id: subscription.subscriber,
                notify_on: subscription.triggers.clone(),
                method: subscription.methods.clone(),
                resource: resource.clone(),
                last_check_time: binding.last_check_time.map(encode_iso),
            },
        })
    }
}

fn log_failure(failure: &DispatchFailure, completion: &Completion) {
    let deferred_until = match completion {
        Completion::Defer { next_check_time } => Some(encode_iso(*next_check_time)),
        _ => None,
    };
    match failure {
        DispatchFailure::Callback(e) if e.is_retryable() => {
            warn!(
                error = %failure,
                kind = ?e.kind(),
                deferred_until = ?deferred_until,
                "callback failed"
            )
        }
        DispatchFailure::Callback(e) => {
            error!(
                error = %failure,
                kind = ?e.kind(),
                deferred_until = ?deferred_until,
                "callback failed"
            )
        }
        _ => error!(error = %failure, deferred_until = ?deferred_until, "dispatch failed"),
    }
}
