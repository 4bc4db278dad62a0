//! The store seam between the execution loop and the shared job queue.
//!
//! The loop only ever talks to the queue through [`JobStore`], so its
//! semantics can be exercised against a scripted in-memory store in tests.
//! The production implementation is [`queue_db::QueueDb`].

use async_trait::async_trait;
use chrono::Utc;
use queue_db::{Job, JobId, JobSpec, QueueDb};
use serde_json::Value as JsonValue;

use crate::worker_id::WorkerId;

/// Boxed error for store operations and task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operations the worker consumes from the shared job store.
///
/// Contract notes:
/// - `get_job` atomically selects and leases one ready job for this worker,
///   or returns `None`. It must skip jobs whose flag set intersects
///   `flags_to_skip` and jobs whose task is not in `supported_tasks`.
///   `use_local_time` selects whether the lease is stamped with the worker's
///   clock or the store's.
/// - `complete_job` / `fail_job` release the lease and must be idempotent
///   against already-reported jobs.
/// - `reset_locked_at` clears stale peer leases, best-effort.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn get_job(
        &self,
        worker_id: &WorkerId,
        supported_tasks: &[String],
        flags_to_skip: Option<&[String]>,
        use_local_time: bool,
    ) -> Result<Option<Job>, BoxError>;

    async fn complete_job(&self, worker_id: &WorkerId, job_id: JobId) -> Result<(), BoxError>;

    async fn fail_job(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        message: &str,
    ) -> Result<(), BoxError>;

    async fn reset_locked_at(&self) -> Result<u64, BoxError>;

    /// Schedules a new job. Exposed to task handlers through
    /// [`crate::JobHelpers::add_job`].
    async fn add_job(
        &self,
        task_identifier: &str,
        payload: JsonValue,
        spec: &JobSpec,
    ) -> Result<Option<JobId>, BoxError>;
}

#[async_trait]
impl JobStore for QueueDb {
    async fn get_job(
        &self,
        worker_id: &WorkerId,
        supported_tasks: &[String],
        flags_to_skip: Option<&[String]>,
        use_local_time: bool,
    ) -> Result<Option<Job>, BoxError> {
        let now = use_local_time.then(Utc::now);
        QueueDb::get_job(self, worker_id.as_str(), supported_tasks, flags_to_skip, now)
            .await
            .map_err(Into::into)
    }

    async fn complete_job(&self, worker_id: &WorkerId, job_id: JobId) -> Result<(), BoxError> {
        QueueDb::complete_job(self, worker_id.as_str(), job_id)
            .await
            .map_err(Into::into)
    }

    async fn fail_job(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        message: &str,
    ) -> Result<(), BoxError> {
        QueueDb::fail_job(self, worker_id.as_str(), job_id, message)
            .await
            .map_err(Into::into)
    }

    async fn reset_locked_at(&self) -> Result<u64, BoxError> {
        QueueDb::reset_locked_at(self).await.map_err(Into::into)
    }

    async fn add_job(
        &self,
        task_identifier: &str,
        payload: JsonValue,
        spec: &JobSpec,
    ) -> Result<Option<JobId>, BoxError> {
        QueueDb::add_job(self, task_identifier, payload, spec)
            .await
            .map_err(Into::into)
    }
}
