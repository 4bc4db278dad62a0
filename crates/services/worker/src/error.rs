//! Fatal worker errors.
//!
//! Everything here ends the worker: its completion settles with the error
//! and no further jobs are leased. Handler failures are deliberately absent;
//! they are recorded against the job and the worker carries on.

use queue_db::JobId;

use crate::store::BoxError;

/// The reasons a worker stops with an error.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// Job acquisition failed while the worker could not retry: either it
    /// runs in one-shot (non-continuous) mode, or it was released while the
    /// acquisition was in flight.
    #[error("failed to get job: {0}")]
    GetJob(#[source] BoxError),

    /// Too many acquisition attempts failed back-to-back. The count resets
    /// on any successful acquisition, so reaching the threshold means the
    /// store has been unreachable for the whole window.
    #[error("Failed {count} times in a row to get a job; latest error: {latest}")]
    ContiguousErrors { count: u32, latest: String },

    /// A job outcome could not be reported to the store. The store's view
    /// of the job is now uncertain; the worker stops immediately and leaves
    /// the lease for peers to reclaim.
    #[error("failed to report outcome of job {job_id} to the store: {source}")]
    Report {
        job_id: JobId,
        #[source]
        source: BoxError,
    },
}
