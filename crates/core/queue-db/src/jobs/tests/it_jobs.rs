//! In-tree DB integration tests for the job queue operations

use chrono::{Duration, Utc};
use pgtemp::PgTempDB;

use crate::{Job, JobSpec, QueueDb, jobs};

async fn connect(temp_db: &PgTempDB) -> QueueDb {
    monitoring::logging::init();
    QueueDb::connect_with_retry(&temp_db.connection_uri(), 2)
        .await
        .expect("Failed to connect to queue db")
}

fn all_tasks() -> Vec<String> {
    vec!["hello".to_string(), "send_email".to_string()]
}

async fn fetch_job(db: &QueueDb, id: jobs::JobId) -> Option<Job> {
    sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(&*db.pool)
        .await
        .expect("Failed to fetch job row")
}

#[tokio::test]
async fn get_job_leases_a_ready_job() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let job_id = db
        .add_job("hello", serde_json::json!({"name": "world"}), &JobSpec::default())
        .await
        .expect("Failed to add job")
        .expect("Job should be inserted");

    //* When
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");

    //* Then
    assert_eq!(job.id, job_id);
    assert_eq!(job.task_identifier, "hello");
    assert_eq!(job.payload, serde_json::json!({"name": "world"}));
    assert_eq!(job.attempts, 1);
    assert_eq!(job.max_attempts, 25);
    assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
    assert!(job.locked_at.is_some());
}

#[tokio::test]
async fn get_job_returns_none_on_empty_queue() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    //* When
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job");

    //* Then
    assert!(job.is_none());
}

#[tokio::test]
async fn get_job_skips_unsupported_tasks() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("exotic_task", serde_json::json!({}), &JobSpec::default())
        .await
        .expect("Failed to add job");

    //* When
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job");

    //* Then
    assert!(job.is_none());
}

#[tokio::test]
async fn get_job_skips_forbidden_flags() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let flagged = JobSpec {
        flags: Some(vec!["tenant:42".to_string()]),
        ..JobSpec::default()
    };
    db.add_job("hello", serde_json::json!({"flagged": true}), &flagged)
        .await
        .expect("Failed to add flagged job");
    let plain_id = db
        .add_job("hello", serde_json::json!({"flagged": false}), &JobSpec::default())
        .await
        .expect("Failed to add plain job")
        .expect("Job should be inserted");

    //* When
    let flags_to_skip = vec!["tenant:42".to_string()];
    let job = db
        .get_job("worker-a", &all_tasks(), Some(&flags_to_skip), None)
        .await
        .expect("Failed to get job")
        .expect("The unflagged job should be ready");

    //* Then
    assert_eq!(job.id, plain_id);
}

#[tokio::test]
async fn get_job_respects_run_at() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let deferred = JobSpec {
        run_at: Some(Utc::now() + Duration::hours(1)),
        ..JobSpec::default()
    };
    db.add_job("hello", serde_json::json!({}), &deferred)
        .await
        .expect("Failed to add deferred job");

    //* When
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job");

    //* Then
    assert!(job.is_none());
}

#[tokio::test]
async fn get_job_with_caller_clock_sees_deferred_job() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let deferred = JobSpec {
        run_at: Some(Utc::now() + Duration::hours(1)),
        ..JobSpec::default()
    };
    let job_id = db
        .add_job("hello", serde_json::json!({}), &deferred)
        .await
        .expect("Failed to add deferred job")
        .expect("Job should be inserted");

    //* When
    // From the caller's (future) clock, the job is already due
    let job = db
        .get_job(
            "worker-a",
            &all_tasks(),
            None,
            Some(Utc::now() + Duration::hours(2)),
        )
        .await
        .expect("Failed to get job")
        .expect("The job should be due by the caller clock");

    //* Then
    assert_eq!(job.id, job_id);
}

#[tokio::test]
async fn get_job_does_not_hand_out_a_held_lease() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("hello", serde_json::json!({}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    db.get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");

    //* When
    let second = db
        .get_job("worker-b", &all_tasks(), None, None)
        .await
        .expect("Failed to get job");

    //* Then
    assert!(second.is_none());
}

#[tokio::test]
async fn get_job_skips_exhausted_jobs() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let one_shot = JobSpec {
        max_attempts: Some(1),
        ..JobSpec::default()
    };
    let job_id = db
        .add_job("hello", serde_json::json!({}), &one_shot)
        .await
        .expect("Failed to add job")
        .expect("Job should be inserted");

    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");
    db.fail_job("worker-a", job.id, "boom")
        .await
        .expect("Failed to fail job");

    //* When
    let retry = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job");

    //* Then
    assert!(retry.is_none());
    let row = fetch_job(&db, job_id).await.expect("Job row should remain");
    assert_eq!(row.attempts, row.max_attempts);
}

#[tokio::test]
async fn complete_job_removes_the_row() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("hello", serde_json::json!({}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");

    //* When
    db.complete_job("worker-a", job.id)
        .await
        .expect("Failed to complete job");

    //* Then
    assert!(fetch_job(&db, job.id).await.is_none());
}

#[tokio::test]
async fn complete_job_ignores_a_foreign_lease() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("hello", serde_json::json!({}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");

    //* When
    // A worker that does not hold the lease reports completion
    db.complete_job("worker-b", job.id)
        .await
        .expect("Failed to complete job");

    //* Then
    let row = fetch_job(&db, job.id).await.expect("Job row should remain");
    assert_eq!(row.locked_by.as_deref(), Some("worker-a"));
}

#[tokio::test]
async fn fail_job_records_the_message_and_reschedules() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("hello", serde_json::json!({}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    let job = db
        .get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");
    let leased_run_at = job.run_at;

    //* When
    db.fail_job("worker-a", job.id, "boom")
        .await
        .expect("Failed to fail job");

    //* Then
    let row = fetch_job(&db, job.id).await.expect("Job row should remain");
    assert_eq!(row.last_error.as_deref(), Some("boom"));
    assert_eq!(row.attempts, 1);
    assert!(row.locked_by.is_none());
    assert!(row.locked_at.is_none());
    assert!(row.run_at > leased_run_at);
}

#[tokio::test]
async fn reset_locked_at_unsticks_stale_leases_only() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    db.add_job("hello", serde_json::json!({"stale": true}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    db.add_job("hello", serde_json::json!({"stale": false}), &JobSpec::default())
        .await
        .expect("Failed to add job");
    let stale = db
        .get_job("worker-dead", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");
    let fresh = db
        .get_job("worker-alive", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A second job should be ready");

    // Age the first lease past the stale threshold
    sqlx::query("UPDATE jobs SET locked_at = now() - interval '5 hours' WHERE id = $1")
        .bind(stale.id)
        .execute(&*db.pool)
        .await
        .expect("Failed to age the lease");

    //* When
    let unstuck = db
        .reset_locked_at()
        .await
        .expect("Failed to reset stale leases");

    //* Then
    assert_eq!(unstuck, 1);
    let stale_row = fetch_job(&db, stale.id).await.expect("Job row should remain");
    assert!(stale_row.locked_by.is_none());
    assert!(stale_row.locked_at.is_none());
    let fresh_row = fetch_job(&db, fresh.id).await.expect("Job row should remain");
    assert_eq!(fresh_row.locked_by.as_deref(), Some("worker-alive"));
}

#[tokio::test]
async fn add_job_with_key_updates_the_pending_job() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let keyed = JobSpec {
        key: Some("report:2026-08".to_string()),
        ..JobSpec::default()
    };
    let first = db
        .add_job("hello", serde_json::json!({"rev": 1}), &keyed)
        .await
        .expect("Failed to add job")
        .expect("Job should be inserted");

    //* When
    let second = db
        .add_job("hello", serde_json::json!({"rev": 2}), &keyed)
        .await
        .expect("Failed to add job")
        .expect("The pending keyed job should be updated");

    //* Then
    assert_eq!(first, second);
    let row = fetch_job(&db, first).await.expect("Job row should remain");
    assert_eq!(row.payload, serde_json::json!({"rev": 2}));
    assert_eq!(row.attempts, 0);
}

#[tokio::test]
async fn add_job_with_key_leaves_a_locked_job_untouched() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;

    let keyed = JobSpec {
        key: Some("report:2026-08".to_string()),
        ..JobSpec::default()
    };
    let first = db
        .add_job("hello", serde_json::json!({"rev": 1}), &keyed)
        .await
        .expect("Failed to add job")
        .expect("Job should be inserted");
    db.get_job("worker-a", &all_tasks(), None, None)
        .await
        .expect("Failed to get job")
        .expect("A job should be ready");

    //* When
    let second = db
        .add_job("hello", serde_json::json!({"rev": 2}), &keyed)
        .await
        .expect("Failed to add job");

    //* Then
    assert!(second.is_none());
    let row = fetch_job(&db, first).await.expect("Job row should remain");
    assert_eq!(row.payload, serde_json::json!({"rev": 1}));
}
