//! A fixed pool of dispatch workers draining the job queue.
//!
//! Workers share one receiver. Each takes a job, runs it to completion, and
//! goes back for the next; shutdown is only observed between jobs so an
//! in-flight callback always finishes and releases its lease.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::matcher::DispatchJob;

use super::{CallbackClient, Dispatcher};

/// Default number of concurrent dispatch workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Spawns `workers` tasks that dispatch jobs from `rx` until it closes or
/// `shutdown` is cancelled.
pub fn spawn_workers<C>(
    dispatcher: Arc<Dispatcher<C>>,
    rx: mpsc::UnboundedReceiver<DispatchJob>,
    workers: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    C: CallbackClient + 'static,
{
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let dispatcher = Arc::clone(&dispatcher);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else {
                        debug!(worker, "job queue closed");
                        break;
                    };
                    let report = dispatcher.dispatch(job).await;
                    debug!(
                        worker,
                        binding = %report.binding,
                        outcome = %report.message(),
                        "job finished"
                    );
                }
                info!(worker, "dispatch worker stopped");
            })
        })
        .collect()
}
