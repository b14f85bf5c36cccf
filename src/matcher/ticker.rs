//! Periodic driver for [`Matcher::check_due`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Matcher;
use crate::clock::Clock;

/// Runs the Matcher once per `period` until `shutdown` is cancelled.
///
/// The first tick fires immediately. A tick that overruns delays the next
/// one rather than bunching them up.
pub async fn run_ticker(
    matcher: Arc<Matcher>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "matcher ticker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping matcher ticker");
                break;
            }

            _ = interval.tick() => {
                match matcher.check_due(clock.now()) {
                    Ok(report) => debug!(
                        scheduled = report.scheduled,
                        reclaimed = report.reclaimed,
                        "{}",
                        report.message()
                    ),
                    Err(e) => error!(error = %e, "matcher tick failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::matcher::DispatchJob;
    use crate::store::{SubscriptionDb, SubscriptionStore};
    use crate::test_utils::{subscription, t0, task_catalog, task_record};
    use crate::types::{Frequency, ResourceName, Trigger};
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn ticker_schedules_and_stops_on_shutdown() {
        let store = Arc::new(SubscriptionDb::in_memory());
        store
            .subscribe(
                subscription(Frequency::Hourly, &[Trigger::New], &["project_task"]),
                t0(),
            )
            .unwrap();
        let catalog = Arc::new(task_catalog());
        catalog
            .push_record(
                &ResourceName::new("project_task"),
                task_record(10, "Late", t0(), t0() + ChronoDuration::minutes(1)),
            )
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        let matcher = Arc::new(Matcher::new(
            store,
            catalog,
            Arc::new(tx),
            ChronoDuration::minutes(30),
        ));
        let clock = Arc::new(FixedClock::new(t0() + ChronoDuration::minutes(2)));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_ticker(
            matcher,
            clock,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let job = rx.recv().await.unwrap();
        assert_eq!(job.binding.0, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
