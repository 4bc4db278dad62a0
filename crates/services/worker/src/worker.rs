use std::{
    env,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures::FutureExt as _;
use queue_db::Job;
use rand::Rng as _;
use tokio::sync::{Notify, watch};
use tracing::Instrument as _;

use crate::{
    config::{ForbiddenFlags, WorkerOptions, defaults},
    error::FatalError,
    events::{EventBus, WorkerEvent},
    store::{BoxError, JobStore},
    tasks::{JobHelpers, TaskError, TaskRegistry},
    worker_id::WorkerId,
};

/// Fallback message recorded when a handler error renders to nothing.
const NO_ERROR_MESSAGE: &str = "Non error or error without message thrown.";

/// The settled outcome of a worker.
pub type CompletionResult = Result<(), Arc<FatalError>>;

/// A single worker: leases jobs from the shared store, executes their
/// handlers, reports the outcomes, and keeps peer leases healthy.
///
/// The execution loop runs on one dedicated task, so it is never
/// concurrently re-entered; `nudge` and `release` only signal it. A second
/// background task periodically clears leases abandoned by dead workers.
///
/// In continuous mode the loop runs until released; otherwise it stops
/// after the first empty acquisition or the first acquisition error.
pub struct Worker {
    shared: Arc<Shared>,
    completion: watch::Receiver<Option<CompletionResult>>,
}

impl Worker {
    /// Spawns a worker and immediately schedules its first acquisition
    /// attempt and a randomly delayed lease-recovery pass.
    ///
    /// # Panics
    ///
    /// Panics if `options.min_reset_locked_interval` is not strictly below
    /// `options.max_reset_locked_interval`.
    pub fn spawn(
        options: WorkerOptions,
        tasks: TaskRegistry,
        store: Arc<dyn JobStore>,
        events: EventBus,
        continuous: bool,
    ) -> Worker {
        assert!(
            options.min_reset_locked_interval < options.max_reset_locked_interval,
            "min_reset_locked_interval must be strictly below max_reset_locked_interval"
        );

        let worker_id = options.worker_id.clone().unwrap_or_else(WorkerId::random);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            worker_id: worker_id.clone(),
            active: AtomicBool::new(true),
            again: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            active_job: Mutex::new(None),
            nudge: Notify::new(),
            shutdown_tx,
            events,
        });

        shared.events.emit(WorkerEvent::Create {
            worker_id: worker_id.clone(),
        });
        tracing::debug!(worker_id = %worker_id, continuous, "worker created");

        let reset_handle = tokio::spawn(reset_locked_loop(
            Arc::clone(&shared),
            Arc::clone(&store),
            options.min_reset_locked_interval,
            options.max_reset_locked_interval,
            shutdown_rx.clone(),
        ));

        let worker_loop = WorkerLoop {
            shared: Arc::clone(&shared),
            store,
            supported_tasks: tasks.identifiers(),
            tasks,
            poll_interval: options.poll_interval,
            max_contiguous_errors: options.max_contiguous_errors,
            use_local_time: options.use_local_time,
            forbidden_flags: options.forbidden_flags,
            continuous,
            contiguous_errors: 0,
            shutdown_rx,
        };

        let runner_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let result = worker_loop.run().await.map_err(Arc::new);

            // Covers both an external release() and every internal exit
            // path; idempotent.
            runner_shared.release();

            // The completion settles only once the final lease-recovery
            // pass has settled too.
            let _ = reset_handle.await;

            let error = result.as_ref().err().map(|err| err.to_string());
            let _ = completion_tx.send(Some(result));
            runner_shared.events.emit(WorkerEvent::Stop {
                worker_id: runner_shared.worker_id.clone(),
                error,
            });
        });

        Worker {
            shared,
            completion: completion_rx,
        }
    }

    /// This worker's identity: the lease owner in all store operations.
    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.worker_id
    }

    /// Snapshot of the job currently being executed, if any.
    #[must_use]
    pub fn active_job(&self) -> Option<Job> {
        self.shared.active_job()
    }

    /// Signals that new work may be available, letting the worker skip its
    /// poll-interval wait.
    ///
    /// Returns `true` when the worker was idle and an acquisition attempt
    /// was triggered immediately; `false` when an acquisition or a job is
    /// already in flight, in which case the current iteration re-polls
    /// without delay should it come up empty.
    ///
    /// # Panics
    ///
    /// Panics if the worker was already released.
    pub fn nudge(&self) -> bool {
        assert!(
            self.shared.is_active(),
            "nudge() called on a released worker"
        );
        if self.shared.idle.swap(false, Ordering::SeqCst) {
            self.shared.nudge.notify_one();
            true
        } else {
            self.shared.again.store(true, Ordering::SeqCst);
            false
        }
    }

    /// Initiates shutdown and returns the completion. Idempotent.
    ///
    /// No further jobs are leased; an in-flight acquisition, handler, or
    /// outcome report is awaited to its natural end, never aborted.
    pub fn release(&self) -> Completion {
        self.shared.release();
        self.completion()
    }

    /// The worker's one-shot completion.
    ///
    /// Settles with `Ok` on a clean stop and with the fatal error when the
    /// worker stopped because it could not safely continue.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.completion.clone(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.shared.worker_id)
            .field("active", &self.shared.is_active())
            .finish()
    }
}

/// Handle to a worker's one-shot completion. See [`Worker::completion`].
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<CompletionResult>>,
}

impl Completion {
    /// Waits for the worker to fully stop.
    pub async fn wait(mut self) -> CompletionResult {
        let settled = self
            .rx
            .wait_for(Option::is_some)
            .await
            .expect("worker runner task dropped without settling its completion");
        settled
            .clone()
            .expect("wait_for yielded an unsettled completion")
    }
}

/// State shared between the loop task, the lease-recovery task, and the
/// control surface.
struct Shared {
    worker_id: WorkerId,
    /// False exactly once `release` has run; all scheduling consults it.
    active: AtomicBool,
    /// Latched by `nudge` while an acquisition is in flight; consumed by
    /// the loop to re-poll immediately instead of waiting.
    again: AtomicBool,
    /// True exactly while the loop sits in its between-polls wait.
    idle: AtomicBool,
    active_job: Mutex<Option<Job>>,
    nudge: Notify,
    shutdown_tx: watch::Sender<bool>,
    events: EventBus,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn active_job(&self) -> Option<Job> {
        self.active_job.lock().expect("active job lock poisoned").clone()
    }

    fn set_active_job(&self, job: Option<Job>) {
        *self.active_job.lock().expect("active job lock poisoned") = job;
    }

    /// Idempotent shutdown: flips `active`, stops the lease-recovery task
    /// from re-arming, wakes an idle loop, and emits the release event once.
    fn release(&self) -> bool {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            self.events.emit(WorkerEvent::Release {
                worker_id: self.worker_id.clone(),
            });
            tracing::debug!(worker_id = %self.worker_id, "worker released");
            true
        } else {
            false
        }
    }
}

/// The sequential execution loop. Owned by exactly one task; every `await`
/// in here suspends the whole loop, which is what guarantees it is never
/// concurrently re-entered.
struct WorkerLoop {
    shared: Arc<Shared>,
    store: Arc<dyn JobStore>,
    tasks: TaskRegistry,
    /// Registry snapshot forwarded to the store on every acquisition.
    supported_tasks: Vec<String>,
    poll_interval: Duration,
    max_contiguous_errors: u32,
    use_local_time: bool,
    forbidden_flags: Option<ForbiddenFlags>,
    continuous: bool,
    contiguous_errors: u32,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn run(mut self) -> Result<(), FatalError> {
        loop {
            if !self.shared.is_active() {
                return Ok(());
            }
            self.shared.again.store(false, Ordering::SeqCst);

            match self.acquire().await {
                Err(err) => {
                    self.shared.events.emit(WorkerEvent::GetJobError {
                        worker_id: self.shared.worker_id.clone(),
                        error: err.to_string(),
                    });
                    tracing::error!(
                        worker_id = %self.shared.worker_id,
                        error = %err,
                        "failed to get job"
                    );

                    if !self.continuous {
                        return Err(FatalError::GetJob(err));
                    }
                    self.contiguous_errors += 1;
                    if self.contiguous_errors >= self.max_contiguous_errors {
                        return Err(FatalError::ContiguousErrors {
                            count: self.contiguous_errors,
                            latest: err.to_string(),
                        });
                    }
                    if !self.shared.is_active() {
                        // Released while the acquisition was in flight.
                        return Err(FatalError::GetJob(err));
                    }
                    if !self.idle_wait().await {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    self.contiguous_errors = 0;
                    self.shared.events.emit(WorkerEvent::GetJobEmpty {
                        worker_id: self.shared.worker_id.clone(),
                    });

                    if !self.continuous || !self.shared.is_active() {
                        return Ok(());
                    }
                    if self.shared.again.swap(false, Ordering::SeqCst) {
                        // Nudged while the poll was in flight: skip the wait.
                        continue;
                    }
                    if !self.idle_wait().await {
                        return Ok(());
                    }
                }
                Ok(Some(job)) => {
                    self.contiguous_errors = 0;
                    self.shared.set_active_job(Some(job.clone()));
                    self.shared.events.emit(WorkerEvent::JobStart {
                        worker_id: self.shared.worker_id.clone(),
                        job: job.clone(),
                    });

                    let outcome = self.execute(job).await;
                    self.shared.set_active_job(None);
                    outcome?;

                    // A finished job loops straight into the next
                    // acquisition; the poll interval only applies to empty
                    // polls and acquisition errors.
                }
            }
        }
    }

    /// One acquisition attempt: resolve the flag skip-list, then ask the
    /// store for a job. A flag-resolution failure counts as an acquisition
    /// failure.
    async fn acquire(&self) -> Result<Option<Job>, BoxError> {
        let flags_to_skip = match &self.forbidden_flags {
            Some(flags) => Some(flags.resolve().await?),
            None => None,
        };

        self.shared.events.emit(WorkerEvent::GetJobStart {
            worker_id: self.shared.worker_id.clone(),
        });

        self.store
            .get_job(
                &self.shared.worker_id,
                &self.supported_tasks,
                flags_to_skip.as_deref(),
                self.use_local_time,
            )
            .await
    }

    /// Waits for the next poll. Wakes early on a nudge or on release.
    /// Returns whether the worker is still active.
    async fn idle_wait(&mut self) -> bool {
        // Drop any stale wakeup left over from a nudge that raced a timer
        // expiry. Permits can only be stored while `idle` is set, so
        // anything present now is stale.
        let _ = self.shared.nudge.notified().now_or_never();

        self.shared.idle.store(true, Ordering::SeqCst);
        if *self.shutdown_rx.borrow() {
            self.shared.idle.store(false, Ordering::SeqCst);
            return false;
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shared.nudge.notified() => {}
            _ = shutdown_rx.changed() => {}
        }

        self.shared.idle.store(false, Ordering::SeqCst);
        self.shared.is_active()
    }

    /// Runs one leased job to its reported outcome.
    ///
    /// Handler failures (errors, panics, unknown tasks) are recorded
    /// against the job and leave the worker healthy. A failure to *report*
    /// the outcome is fatal: the store's view of the job is then uncertain,
    /// so the worker stops and leaves the lease for peers to reclaim.
    async fn execute(&self, job: Job) -> Result<(), FatalError> {
        let worker_id = &self.shared.worker_id;
        let start = Instant::now();
        let handler_result = self.invoke_handler(&job).await;
        let duration = start.elapsed();

        match handler_result {
            Err(err) => {
                let mut message = err.to_string();
                if message.is_empty() {
                    message = NO_ERROR_MESSAGE.to_string();
                }

                self.shared.events.emit(WorkerEvent::JobError {
                    worker_id: worker_id.clone(),
                    job: job.clone(),
                    error: message.clone(),
                });
                if job.is_final_attempt() {
                    self.shared.events.emit(WorkerEvent::JobFailed {
                        worker_id: worker_id.clone(),
                        job: job.clone(),
                        error: message.clone(),
                    });
                }

                tracing::error!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    task_identifier = %job.task_identifier,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    duration_ms = duration.as_millis() as u64,
                    error = %message,
                    "task failed"
                );

                self.store
                    .fail_job(worker_id, job.id, &message)
                    .await
                    .map_err(|source| self.fatal_report(&job, source))?;

                self.shared.events.emit(WorkerEvent::JobComplete {
                    worker_id: worker_id.clone(),
                    job,
                    error: Some(message),
                });
            }
            Ok(()) => {
                self.shared.events.emit(WorkerEvent::JobSuccess {
                    worker_id: worker_id.clone(),
                    job: job.clone(),
                    duration,
                });
                if log_success() {
                    tracing::info!(
                        worker_id = %worker_id,
                        job_id = %job.id,
                        task_identifier = %job.task_identifier,
                        duration_ms = duration.as_millis() as u64,
                        "task completed"
                    );
                }

                self.store
                    .complete_job(worker_id, job.id)
                    .await
                    .map_err(|source| self.fatal_report(&job, source))?;

                self.shared.events.emit(WorkerEvent::JobComplete {
                    worker_id: worker_id.clone(),
                    job,
                    error: None,
                });
            }
        }

        Ok(())
    }

    /// Looks up and runs the job's handler, isolating its failures.
    ///
    /// The handler future runs on its own task so that a panic surfaces as
    /// a job failure instead of tearing down the execution loop.
    async fn invoke_handler(&self, job: &Job) -> Result<(), TaskError> {
        let Some(handler) = self.tasks.get(&job.task_identifier) else {
            return Err(TaskError::Unsupported(job.task_identifier.clone()));
        };

        let span = tracing::info_span!(
            "job",
            worker_id = %self.shared.worker_id,
            job_id = %job.id,
            task_identifier = %job.task_identifier,
        );
        let helpers = JobHelpers::new(
            job.clone(),
            self.shared.worker_id.clone(),
            Arc::clone(&self.store),
            span.clone(),
        );
        let payload = job.payload.clone();

        let handle =
            tokio::spawn(async move { handler.run(payload, helpers).await }.instrument(span));
        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".to_string());
                Err(TaskError::Panicked(message))
            }
            Err(join_err) => Err(TaskError::Failed(join_err.into())),
        }
    }

    /// Marks the seppuku condition: emits the fatal event and builds the
    /// error the worker stops with.
    fn fatal_report(&self, job: &Job, source: BoxError) -> FatalError {
        let err = FatalError::Report {
            job_id: job.id,
            source,
        };
        self.shared.events.emit(WorkerEvent::FatalError {
            worker_id: self.shared.worker_id.clone(),
            error: err.to_string(),
            job_id: Some(job.id),
        });
        tracing::error!(
            worker_id = %self.shared.worker_id,
            job_id = %job.id,
            error = %err,
            "worker fatal error; shutting down"
        );
        err
    }
}

/// Whether the per-job success line should be logged.
///
/// Any non-empty `NO_LOG_SUCCESS` value suppresses it.
fn log_success() -> bool {
    env::var("NO_LOG_SUCCESS").map_or(true, |v| v.is_empty())
}

/// Background lease-recovery: periodically clears leases abandoned by dead
/// workers.
///
/// The first pass fires at a uniformly random delay below the
/// thundering-herd cap; each later pass re-arms uniformly within the
/// configured interval. Failures are logged and never fatal; a peer's
/// next pass recovers whatever this one missed. The task stops re-arming
/// once the worker is released, but an in-flight pass is always allowed to
/// settle first.
async fn reset_locked_loop(
    shared: Arc<Shared>,
    store: Arc<dyn JobStore>,
    min_interval: Duration,
    max_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = rand::rng().random_range(Duration::ZERO..defaults::RESET_LOCKED_FIRST_DELAY_CAP);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }

        let result = store.reset_locked_at().await;

        if !shared.is_active() {
            if let Err(err) = result {
                tracing::error!(
                    worker_id = %shared.worker_id,
                    error = %err,
                    "failed to reset stale leases; worker is shutting down, won't retry"
                );
            }
            break;
        }

        delay = rand::rng().random_range(min_interval..max_interval);
        match result {
            Ok(unstuck) if unstuck > 0 => {
                tracing::info!(
                    worker_id = %shared.worker_id,
                    unstuck,
                    "reclaimed stale job leases"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    worker_id = %shared.worker_id,
                    error = %err,
                    "failed to reset stale leases; will try again in {}ms",
                    delay.as_millis()
                );
            }
        }
    }
}
