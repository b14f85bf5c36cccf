//! The Matcher: finds due bindings, leases them, and enqueues dispatch jobs.
//!
//! One call to [`Matcher::check_due`] is one scheduling tick:
//!
//! 1. Ask the store for bindings that are schedulable by their own state
//!    (live, unleased, `next_check_time` passed, frequency not `never`).
//! 2. Group them by resource and ask the catalog once per resource for the
//!    newest modification since the group's oldest checkpoint. Resources
//!    without modification tracking are skipped.
//! 3. For every binding whose checkpoint is not newer than that modification,
//!    acquire a lease and enqueue a job carrying the binding id.
//!
//! Because the lease is taken before the job is enqueued, a second tick with
//! no intervening completion schedules nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::resource::{ResourceCatalog, ResourceError};
use crate::store::{Completion, DueCandidate, LeaseGrant, StoreError, SubscriptionStore};
use crate::types::{Lease, ResourceName};

pub mod queue;
pub mod ticker;

pub use queue::{DispatchJob, JobQueue, QueueError};
pub use ticker::run_ticker;

/// Default lease lifetime (30 minutes).
pub const DEFAULT_LEASE_TTL_MINS: i64 = 30;

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one scheduling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Jobs enqueued.
    pub scheduled: usize,
    /// Of those, bindings whose expired lease was taken over.
    pub reclaimed: usize,
}

impl ScheduleReport {
    pub fn message(&self) -> String {
        if self.scheduled > 0 {
            format!("{} notifications scheduled.", self.scheduled)
        } else {
            "No notifications to schedule.".to_string()
        }
    }
}

/// Schedules dispatch jobs for due bindings.
pub struct Matcher {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn ResourceCatalog>,
    queue: Arc<dyn JobQueue>,
    lease_ttl: Duration,
}

impl Matcher {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn ResourceCatalog>,
        queue: Arc<dyn JobQueue>,
        lease_ttl: Duration,
    ) -> Self {
        Matcher {
            store,
            catalog,
            queue,
            lease_ttl,
        }
    }

    /// Runs one scheduling tick at `now`.
    ///
    /// # Errors
    ///
    /// Only store failures abort the tick. Catalog errors skip the affected
    /// resource; queue errors roll back the affected lease.
    #[instrument(skip(self))]
    pub fn check_due(&self, now: DateTime<Utc>) -> Result<ScheduleReport, MatcherError> {
        let candidates = self.store.due_candidates(now)?;
        let mut report = ScheduleReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }

        for (resource, group) in group_by_resource(candidates) {
            let Some(newest) = self.newest_change(&resource, oldest_checkpoint(&group)) else {
                continue;
            };

            for candidate in group
                .into_iter()
                .filter(|c| c.last_check_time.is_none_or(|last| last <= newest))
            {
                self.schedule(&candidate, now, &mut report)?;
            }
        }

        if report.scheduled > 0 {
            info!(
                scheduled = report.scheduled,
                reclaimed = report.reclaimed,
                "{}",
                report.message()
            );
        }
        Ok(report)
    }

    /// Newest modification of `resource` since `since`, or `None` if the
    /// resource has no updates or cannot be checked.
    fn newest_change(
        &self,
        resource: &ResourceName,
        since: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self.catalog.newest_modification(resource, since) {
            Ok(newest) => newest,
            Err(ResourceError::Untracked(_)) => {
                debug!(resource = %resource, "skipping resource without modification tracking");
                None
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "failed to check resource for updates");
                None
            }
        }
    }

    fn schedule(
        &self,
        candidate: &DueCandidate,
        now: DateTime<Utc>,
        report: &mut ScheduleReport,
    ) -> Result<(), MatcherError> {
        let binding = candidate.binding;
        let lease = Lease::grant(now, self.lease_ttl);

        match self.store.acquire_lease(binding, lease, now)? {
            LeaseGrant::Acquired => {}
            LeaseGrant::Reclaimed { previous } => {
                warn!(
                    binding = %binding,
                    previous_holder = %previous,
                    "reclaiming expired lease"
                );
                report.reclaimed += 1;
            }
            LeaseGrant::Held | LeaseGrant::Gone => {
                debug!(binding = %binding, "binding no longer schedulable");
                return Ok(());
            }
        }

        if let Err(e) = self.queue.enqueue(DispatchJob { binding }) {
            error!(binding = %binding, error = %e, "failed to enqueue dispatch job");
            self.store.finish_cycle(binding, lease.holder, Completion::Retain)?;
            return Ok(());
        }

        debug!(binding = %binding, holder = %lease.holder, "scheduled dispatch");
        report.scheduled += 1;
        Ok(())
    }
}

fn group_by_resource(candidates: Vec<DueCandidate>) -> BTreeMap<ResourceName, Vec<DueCandidate>> {
    let mut groups: BTreeMap<ResourceName, Vec<DueCandidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.resource.clone())
            .or_default()
            .push(candidate);
    }
    groups
}

/// Oldest checkpoint in the group; `None` (since the beginning) if any
/// binding has never been checked.
fn oldest_checkpoint(group: &[DueCandidate]) -> Option<DateTime<Utc>> {
    group
        .iter()
        .map(|c| c.last_check_time)
        .try_fold(None, |oldest: Option<DateTime<Utc>>, last| {
            let last = last?;
            Some(Some(oldest.map_or(last, |o| o.min(last))))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryCatalog;
    use crate::store::SubscriptionDb;
    use crate::test_utils::{arb_frequency, subscription, t0, task_catalog, task_record};
    use crate::types::{BindingId, Frequency, Trigger};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<SubscriptionDb>,
        catalog: Arc<MemoryCatalog>,
        matcher: Matcher,
        rx: mpsc::UnboundedReceiver<DispatchJob>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SubscriptionDb::in_memory());
        let catalog = Arc::new(task_catalog());
        let (tx, rx) = mpsc::unbounded_channel();
        let matcher = Matcher::new(
            store.clone(),
            catalog.clone(),
            Arc::new(tx),
            Duration::minutes(DEFAULT_LEASE_TTL_MINS),
        );
        Fixture {
            store,
            catalog,
            matcher,
            rx,
        }
    }

    impl Fixture {
        fn subscribe(&self, frequency: Frequency, resources: &[&str]) -> Vec<BindingId> {
            self.store
                .subscribe(subscription(frequency, &[Trigger::New], resources), t0())
                .unwrap();
            let data = self.store.snapshot().unwrap();
            data.bindings.keys().copied().collect()
        }

        fn touch(&self, resource: &str, at: DateTime<Utc>) {
            self.catalog
                .push_record(&ResourceName::new(resource), task_record(99, "x", at, at))
                .unwrap();
        }

        fn drain(&mut self) -> Vec<BindingId> {
            let mut jobs = Vec::new();
            while let Ok(job) = self.rx.try_recv() {
                jobs.push(job.binding);
            }
            jobs
        }
    }

    #[test]
    fn empty_store_schedules_nothing() {
        let f = fixture();
        let report = f.matcher.check_due(t0()).unwrap();
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.message(), "No notifications to schedule.");
    }

    #[test]
    fn schedules_binding_when_resource_changed() {
        let mut f = fixture();
        let bindings = f.subscribe(Frequency::Daily, &["project_task"]);
        f.touch("project_task", t0() + Duration::minutes(5));

        let report = f.matcher.check_due(t0() + Duration::minutes(10)).unwrap();

        assert_eq!(report.scheduled, 1);
        assert_eq!(report.message(), "1 notifications scheduled.");
        assert_eq!(f.drain(), bindings);
        let binding = f.store.binding(bindings[0]).unwrap().unwrap();
        assert!(binding.is_leased(t0() + Duration::minutes(10)));
    }

    #[test]
    fn unchanged_resource_is_not_due() {
        let mut f = fixture();
        f.subscribe(Frequency::Daily, &["project_task"]);

        let report = f.matcher.check_due(t0() + Duration::hours(3)).unwrap();

        assert_eq!(report.scheduled, 0);
        assert!(f.drain().is_empty());
    }

    #[test]
    fn untracked_resource_is_skipped_silently() {
        let mut f = fixture();
        f.subscribe(Frequency::Hourly, &["org_office"]);

        let report = f.matcher.check_due(t0() + Duration::days(30)).unwrap();

        assert_eq!(report.scheduled, 0);
        assert!(f.drain().is_empty());
    }

    #[test]
    fn unknown_resource_does_not_block_others() {
        let mut f = fixture();
        f.subscribe(Frequency::Hourly, &["ghost", "project_task"]);
        f.touch("project_task", t0() + Duration::minutes(1));

        let report = f.matcher.check_due(t0() + Duration::minutes(2)).unwrap();

        assert_eq!(report.scheduled, 1);
        assert_eq!(f.drain().len(), 1);
    }

    #[test]
    fn second_tick_schedules_nothing() {
        let mut f = fixture();
        f.subscribe(Frequency::Hourly, &["project_task"]);
        f.touch("project_task", t0() + Duration::minutes(1));
        let now = t0() + Duration::minutes(2);

        assert_eq!(f.matcher.check_due(now).unwrap().scheduled, 1);
        assert_eq!(f.matcher.check_due(now).unwrap().scheduled, 0);
        assert_eq!(f.drain().len(), 1);
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let mut f = fixture();
        f.subscribe(Frequency::Hourly, &["project_task"]);
        f.touch("project_task", t0() + Duration::minutes(1));
        let first = t0() + Duration::minutes(2);
        assert_eq!(f.matcher.check_due(first).unwrap().scheduled, 1);

        let before_expiry = first + Duration::minutes(DEFAULT_LEASE_TTL_MINS - 1);
        assert_eq!(f.matcher.check_due(before_expiry).unwrap().scheduled, 0);

        let after_expiry = first + Duration::minutes(DEFAULT_LEASE_TTL_MINS);
        let report = f.matcher.check_due(after_expiry).unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(f.drain().len(), 2);
    }

    #[test]
    fn next_check_time_in_future_is_not_due() {
        let mut f = fixture();
        let bindings = f.subscribe(Frequency::Daily, &["project_task"]);
        let lease = Lease::grant(t0(), Duration::minutes(DEFAULT_LEASE_TTL_MINS));
        f.store.acquire_lease(bindings[0], lease, t0()).unwrap();
        f.store
            .finish_cycle(
                bindings[0],
                lease.holder,
                Completion::Defer {
                    next_check_time: t0() + Duration::hours(5),
                },
            )
            .unwrap();
        f.touch("project_task", t0() + Duration::minutes(1));

        assert_eq!(f.matcher.check_due(t0() + Duration::hours(4)).unwrap().scheduled, 0);
        assert_eq!(f.matcher.check_due(t0() + Duration::hours(5)).unwrap().scheduled, 1);
        assert_eq!(f.drain(), bindings);
    }

    #[test]
    fn closed_queue_rolls_back_lease() {
        let f = fixture();
        let bindings = f.subscribe(Frequency::Hourly, &["project_task"]);
        f.touch("project_task", t0() + Duration::minutes(1));
        let Fixture {
            store, matcher, rx, ..
        } = f;
        drop(rx);

        let now = t0() + Duration::minutes(2);
        let report = matcher.check_due(now).unwrap();

        assert_eq!(report.scheduled, 0);
        let binding = store.binding(bindings[0]).unwrap().unwrap();
        assert!(!binding.is_leased(now));
        assert_eq!(binding.last_check_time, Some(t0()));
    }

    #[test]
    fn oldest_checkpoint_prefers_never_checked() {
        let c = |last: Option<DateTime<Utc>>| DueCandidate {
            binding: BindingId(1),
            resource: ResourceName::new("r"),
            last_check_time: last,
        };
        let early = t0();
        let late = t0() + Duration::hours(1);

        assert_eq!(oldest_checkpoint(&[c(Some(late)), c(Some(early))]), Some(early));
        assert_eq!(oldest_checkpoint(&[c(Some(late)), c(None)]), None);
    }

    proptest! {
        /// Bindings owned by `never` subscriptions, or bound to untracked
        /// resources, are never scheduled; a repeated tick schedules nothing.
        #[test]
        fn prop_scheduling_exclusions(
            subs in prop::collection::vec((arb_frequency(), any::<bool>()), 1..8),
            change_after in 0i64..600,
            now_after in 0i64..20_000,
        ) {
            let mut f = fixture();
            for (freq, tracked) in &subs {
                let resource = if *tracked { "project_task" } else { "org_office" };
                f.store
                    .subscribe(subscription(*freq, &[Trigger::New], &[resource]), t0())
                    .unwrap();
            }
            f.touch("project_task", t0() + Duration::minutes(change_after));
            let now = t0() + Duration::minutes(now_after);

            let first = f.matcher.check_due(now).unwrap();
            let second = f.matcher.check_due(now).unwrap();
            prop_assert_eq!(second.scheduled, 0);

            let data = f.store.snapshot().unwrap();
            let scheduled = f.drain();
            prop_assert_eq!(scheduled.len(), first.scheduled);
            for id in scheduled {
                let binding = &data.bindings[&id];
                let owner = &data.subscriptions[&binding.subscription_id];
                prop_assert!(owner.frequency != Frequency::Never);
                prop_assert_eq!(binding.resource.as_str(), "project_task");
            }
        }
    }
}
