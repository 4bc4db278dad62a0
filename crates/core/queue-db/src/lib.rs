//! Postgres-backed job queue store.
//!
//! This crate owns the `jobs` table and the SQL operations workers use to
//! coordinate: atomically leasing a ready job, reporting completion or
//! failure, and recovering leases abandoned by dead workers. The execution
//! loop itself lives in the `worker` crate; everything here is a thin,
//! strongly-typed layer over the queries.

use std::time::Duration;

use chrono::{DateTime, Utc};

mod conn;
mod error;
pub mod jobs;

pub use self::{
    conn::ConnError,
    error::Error,
    jobs::{Job, JobId, JobSpec},
};
use self::conn::ConnPool;

/// Default pool size for the queue DB.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connection pool to the queue DB. Clones will refer to the same instance.
#[derive(Clone, Debug)]
pub struct QueueDb {
    pool: ConnPool,
}

impl QueueDb {
    /// Sets up a connection pool to the queue DB.
    ///
    /// Runs migrations if necessary.
    #[tracing::instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        Self::connect_with_config(url, pool_size, true).await
    }

    /// Sets up a connection pool to the queue DB with configurable migration behavior.
    ///
    /// Runs migrations only if `auto_migrate` is true.
    #[tracing::instrument(skip_all, err)]
    pub async fn connect_with_config(
        url: &str,
        pool_size: u32,
        auto_migrate: bool,
    ) -> Result<Self, Error> {
        let pool = ConnPool::connect(url, pool_size).await?;
        if auto_migrate {
            pool.run_migrations().await?;
        }
        Ok(Self { pool })
    }

    /// Sets up a connection pool with retry logic for temporary databases.
    ///
    /// Ephemeral Postgres instances (e.g. `pgtemp`) may not be ready to accept
    /// connections immediately after startup; retry with a short exponential
    /// backoff until the server reports it is up.
    #[tracing::instrument(skip_all, err)]
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, Error> {
        use backon::{ExponentialBuilder, Retryable};

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_max_times(20);

        (|| Self::connect(url, pool_size))
            .retry(retry_policy)
            .when(is_db_starting_up)
            .notify(|err, dur| {
                tracing::warn!(
                    error = %err,
                    "Database still starting up during connection. Retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }

    /// Atomically selects and leases one ready job for the given worker.
    ///
    /// Returns `None` when no job is ready. See [`jobs::get_job`] for the
    /// selection rules.
    pub async fn get_job(
        &self,
        worker_id: &str,
        supported_tasks: &[String],
        flags_to_skip: Option<&[String]>,
        now: Option<DateTime<Utc>>,
    ) -> Result<Option<Job>, Error> {
        jobs::get_job(&*self.pool, worker_id, supported_tasks, flags_to_skip, now)
            .await
            .map_err(Error::Database)
    }

    /// Marks a job as done and releases its lease by deleting the row.
    pub async fn complete_job(&self, worker_id: &str, job_id: JobId) -> Result<(), Error> {
        jobs::complete_job(&*self.pool, worker_id, job_id)
            .await
            .map_err(Error::Database)
    }

    /// Records a failed attempt and schedules the retry.
    pub async fn fail_job(
        &self,
        worker_id: &str,
        job_id: JobId,
        message: &str,
    ) -> Result<(), Error> {
        jobs::fail_job(&*self.pool, worker_id, job_id, message)
            .await
            .map_err(Error::Database)
    }

    /// Clears leases abandoned by dead workers. Returns the number of
    /// jobs unstuck.
    pub async fn reset_locked_at(&self) -> Result<u64, Error> {
        jobs::reset_locked_at(&*self.pool)
            .await
            .map_err(Error::Database)
    }

    /// Inserts a new job into the queue.
    ///
    /// Returns `None` when the job carries a `key` that collides with an
    /// existing, currently-locked job; the locked job is left untouched.
    pub async fn add_job(
        &self,
        task_identifier: &str,
        payload: serde_json::Value,
        spec: &JobSpec,
    ) -> Result<Option<JobId>, Error> {
        jobs::add_job(&*self.pool, task_identifier, payload, spec)
            .await
            .map_err(Error::Database)
    }
}

fn is_db_starting_up(err: &Error) -> bool {
    match err {
        Error::Connection(sqlx::Error::Database(db_err)) => {
            // 57P03: "the database system is starting up"
            db_err.code().is_some_and(|code| code == "57P03")
        }
        _ => false,
    }
}
