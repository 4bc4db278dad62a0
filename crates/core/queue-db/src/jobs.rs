//! Job queue SQL operations
//!
//! All operations are generic over [`sqlx::Executor`] so they can run on a
//! pool, a single connection, or inside a transaction.
//!
//! Leasing protocol: [`get_job`] claims a ready job by stamping
//! `(locked_by, locked_at)` and bumping `attempts` in a single statement.
//! [`complete_job`] / [`fail_job`] release the lease, and only for the
//! worker that holds it; a lease reclaimed by [`reset_locked_at`] (and
//! possibly re-issued to a peer) is never touched by the original holder's
//! late report.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres, types::JsonValue};

/// In-tree DB integration tests
#[cfg(test)]
mod tests {
    mod it_jobs;
}

/// Atomically select and lease one ready job.
///
/// A job is ready when it is due (`run_at <= now`), has attempts remaining,
/// is not leased (or its lease is stale), is one of `supported_tasks`, and
/// none of its flags appear in `flags_to_skip`. Candidates are taken in
/// `(priority, run_at, id)` order; peers skip rows locked mid-selection
/// (`FOR UPDATE SKIP LOCKED`).
///
/// `now` selects the clock: `Some` stamps and compares with the caller's
/// clock, `None` uses the database's.
#[tracing::instrument(skip(exe, supported_tasks, flags_to_skip), err)]
pub async fn get_job<'c, E>(
    exe: E,
    worker_id: &str,
    supported_tasks: &[String],
    flags_to_skip: Option<&[String]>,
    now: Option<DateTime<Utc>>,
) -> Result<Option<Job>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        WITH candidate AS (
            SELECT id
            FROM jobs
            WHERE run_at <= coalesce($3::timestamptz, now())
              AND attempts < max_attempts
              AND (locked_at IS NULL
                   OR locked_at < coalesce($3::timestamptz, now()) - interval '4 hours')
              AND task_identifier = ANY($2)
              AND ($4::text[] IS NULL OR (flags && $4) IS NOT TRUE)
            ORDER BY priority ASC, run_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs
        SET attempts = attempts + 1,
            locked_by = $1,
            locked_at = coalesce($3::timestamptz, now()),
            updated_at = coalesce($3::timestamptz, now())
        FROM candidate
        WHERE jobs.id = candidate.id
        RETURNING jobs.id, jobs.queue_name, jobs.task_identifier, jobs.payload,
                  jobs.priority, jobs.run_at, jobs.attempts, jobs.max_attempts,
                  jobs.last_error, jobs.key, jobs.locked_at, jobs.locked_by,
                  jobs.flags, jobs.created_at, jobs.updated_at
    "#};
    sqlx::query_as(query)
        .bind(worker_id)
        .bind(supported_tasks)
        .bind(now)
        .bind(flags_to_skip)
        .fetch_optional(exe)
        .await
}

/// Mark a job as done and release its lease.
///
/// Completed jobs are removed from the table entirely. The delete is
/// guarded by `locked_by`, which makes it idempotent: a second report, or a
/// report for a lease that was reclaimed in the meantime, is a no-op.
#[tracing::instrument(skip(exe), err)]
pub async fn complete_job<'c, E>(
    exe: E,
    worker_id: &str,
    job_id: JobId,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        DELETE FROM jobs
        WHERE id = $2 AND locked_by = $1
    "#};
    sqlx::query(query)
        .bind(worker_id)
        .bind(job_id)
        .execute(exe)
        .await?;
    Ok(())
}

/// Record a failed attempt and release the lease.
///
/// The error message is stored verbatim. The retry is scheduled with an
/// exponential backoff derived from the attempt count, capped at `e^10`
/// seconds (~6.1 hours). A job whose attempts are exhausted simply stays
/// unlocked with `attempts = max_attempts` and is never selected again.
#[tracing::instrument(skip(exe, message), err)]
pub async fn fail_job<'c, E>(
    exe: E,
    worker_id: &str,
    job_id: JobId,
    message: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET last_error = $3,
            run_at = greatest(now(), run_at) + (exp(least(attempts, 10)) * interval '1 second'),
            locked_by = null,
            locked_at = null,
            updated_at = now()
        WHERE id = $2 AND locked_by = $1
    "#};
    sqlx::query(query)
        .bind(worker_id)
        .bind(job_id)
        .bind(message)
        .execute(exe)
        .await?;
    Ok(())
}

/// Clear leases abandoned by dead workers.
///
/// A lease older than 4 hours is considered abandoned: its worker either
/// crashed or lost connectivity, and the job may be handed to a peer.
/// Best-effort maintenance: every worker runs this periodically, so a
/// failure here is recovered by a peer's next pass. Returns the number of
/// jobs unstuck.
#[tracing::instrument(skip(exe), err)]
pub async fn reset_locked_at<'c, E>(exe: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET locked_at = null,
            locked_by = null,
            updated_at = now()
        WHERE locked_at < now() - interval '4 hours'
    "#};
    let res = sqlx::query(query).execute(exe).await?;
    Ok(res.rows_affected())
}

/// Insert a new job into the queue.
///
/// When [`JobSpec::key`] is set and a job with that key already exists, the
/// existing job is updated in place (payload, schedule, attempt counters
/// reset) unless it is currently locked; a locked keyed job is left
/// untouched and `None` is returned.
#[tracing::instrument(skip(exe, payload, spec), err)]
pub async fn add_job<'c, E>(
    exe: E,
    task_identifier: &str,
    payload: JsonValue,
    spec: &JobSpec,
) -> Result<Option<JobId>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO jobs (queue_name, task_identifier, payload, priority, run_at,
                          max_attempts, key, flags)
        VALUES ($1, $2, $3, coalesce($4, 0), coalesce($5::timestamptz, now()),
                coalesce($6, 25), $7, $8)
        ON CONFLICT (key) DO UPDATE
        SET queue_name = excluded.queue_name,
            task_identifier = excluded.task_identifier,
            payload = excluded.payload,
            priority = excluded.priority,
            run_at = excluded.run_at,
            max_attempts = excluded.max_attempts,
            flags = excluded.flags,
            attempts = 0,
            last_error = null,
            updated_at = now()
        WHERE jobs.locked_at IS NULL
        RETURNING id
    "#};
    sqlx::query_scalar(query)
        .bind(&spec.queue_name)
        .bind(task_identifier)
        .bind(payload)
        .bind(spec.priority)
        .bind(spec.run_at)
        .bind(spec.max_attempts)
        .bind(&spec.key)
        .bind(&spec.flags)
        .fetch_optional(exe)
        .await
}

/// Represents a job in the queue: one unit of work owned by at most one
/// worker at a time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: JobId,

    /// Optional queue the job belongs to. Carried as data; the store does
    /// not serialize execution per queue.
    pub queue_name: Option<String>,

    /// Name of the task handler that executes this job
    pub task_identifier: String,

    /// Handler input, stored as JSON
    pub payload: JsonValue,

    /// Lower values run first
    pub priority: i32,

    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,

    /// Number of times the job has been leased, including the current lease
    pub attempts: i32,

    /// Attempts after which the job is considered permanently failed
    pub max_attempts: i32,

    /// Message recorded by the most recent failed attempt
    pub last_error: Option<String>,

    /// Optional deduplication key
    pub key: Option<String>,

    /// When the current lease was taken
    pub locked_at: Option<DateTime<Utc>>,

    /// Worker holding the current lease
    pub locked_by: Option<String>,

    /// Labels used to skip jobs at selection time
    pub flags: Option<Vec<String>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the current attempt is the job's last: a failure now is
    /// permanent, not retried.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A unique identifier for a job
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Convert the [`JobId`] to an `i64`
    pub fn to_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        JobId(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optional scheduling parameters for [`add_job`].
///
/// Unset fields fall back to the column defaults: immediate `run_at`,
/// priority 0, 25 max attempts, no queue, no key, no flags.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub queue_name: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
    pub key: Option<String>,
    pub flags: Option<Vec<String>>,
}
