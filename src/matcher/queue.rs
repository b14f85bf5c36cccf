//! The job queue between the Matcher and the Dispatch Worker pool.
//!
//! Jobs carry only a binding id; workers reload everything else from the
//! store. Delivery is at-least-once: a job may be seen twice, and the
//! dispatcher tolerates that.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::BindingId;

/// One unit of work for the Dispatch Worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub binding: BindingId,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Every consumer is gone.
    #[error("job queue closed")]
    Closed,
}

/// Accepts jobs for asynchronous dispatch.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: DispatchJob) -> Result<(), QueueError>;
}

impl JobQueue for mpsc::UnboundedSender<DispatchJob> {
    fn enqueue(&self, job: DispatchJob) -> Result<(), QueueError> {
        self.send(job).map_err(|_| QueueError::Closed)
    }
}
