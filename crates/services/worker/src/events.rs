//! Worker lifecycle event bus.
//!
//! Every observable transition of the worker is published as a
//! [`WorkerEvent`] on a broadcast channel. Emission is fire-and-forget:
//! a bus without subscribers, or a subscriber that lags behind, never
//! affects the worker. Subscribers observing a `Lagged` error have missed
//! events and should resynchronize from worker state.

use std::time::Duration;

use queue_db::{Job, JobId};
use tokio::sync::broadcast;

use crate::worker_id::WorkerId;

/// Default buffer size for the event bus.
const DEFAULT_CAPACITY: usize = 128;

/// Events emitted by a worker over its lifetime.
///
/// Per worker, `Create` precedes every other event; `Release` precedes the
/// settling of the completion; `Stop` fires exactly once, after settlement,
/// carrying the error iff the worker stopped fatally. Per job, `Start` is
/// followed by exactly one of `Success` or `Error` (plus `Failed` when the
/// final attempt is exhausted) and then `Complete`.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker was constructed and is about to start polling.
    Create { worker_id: WorkerId },

    /// An acquisition attempt is starting.
    GetJobStart { worker_id: WorkerId },

    /// The acquisition attempt found no ready job.
    GetJobEmpty { worker_id: WorkerId },

    /// The acquisition attempt failed.
    GetJobError { worker_id: WorkerId, error: String },

    /// The worker hit an unrecoverable error and is shutting down.
    FatalError {
        worker_id: WorkerId,
        error: String,
        job_id: Option<JobId>,
    },

    /// The worker was released; no further jobs will be leased.
    Release { worker_id: WorkerId },

    /// The worker has fully stopped and its completion has settled.
    Stop {
        worker_id: WorkerId,
        error: Option<String>,
    },

    /// A job was leased and its handler is about to run.
    JobStart { worker_id: WorkerId, job: Job },

    /// The handler finished successfully.
    JobSuccess {
        worker_id: WorkerId,
        job: Job,
        duration: Duration,
    },

    /// The handler failed; the attempt was recorded.
    JobError {
        worker_id: WorkerId,
        job: Job,
        error: String,
    },

    /// The handler failed on the job's final attempt; the job is
    /// permanently failed.
    JobFailed {
        worker_id: WorkerId,
        job: Job,
        error: String,
    },

    /// The job's outcome was reported to the store.
    JobComplete {
        worker_id: WorkerId,
        job: Job,
        error: Option<String>,
    },
}

/// A shared, clonable handle to the worker event stream.
///
/// A pool of workers shares a single bus; events identify their worker.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Never fails: an error from the channel only
    /// means there is currently no subscriber.
    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
