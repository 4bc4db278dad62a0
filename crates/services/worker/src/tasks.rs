//! Task handlers, the registry that names them, and the per-job helper
//! context they receive.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use queue_db::{Job, JobId, JobSpec};
use serde_json::Value as JsonValue;

use crate::{
    store::{BoxError, JobStore},
    worker_id::WorkerId,
};

/// A task handler: the user code executed for every job registered under
/// its identifier.
///
/// Handlers receive the job payload and a [`JobHelpers`] context. A
/// returned error records a failed attempt; it never stops the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, payload: JsonValue, helpers: JobHelpers) -> Result<(), BoxError>;
}

/// How a job execution failed, from the worker's point of view.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The job names a task that is not in the registry.
    #[error("Unsupported task '{0}'")]
    Unsupported(String),

    /// The handler returned an error. Renders as the handler's own message.
    #[error("{0}")]
    Failed(#[source] BoxError),

    /// The handler panicked; the panic payload is rendered best-effort.
    #[error("task handler panicked: {0}")]
    Panicked(String),
}

/// The identifier is already taken by another handler.
#[derive(Debug, thiserror::Error)]
#[error("task '{0}' is already registered")]
pub struct DuplicateTaskError(pub String);

/// Mapping from task identifier to handler.
///
/// The worker snapshots the registry at spawn time; the identifier list is
/// forwarded to the store so only supported jobs are ever leased.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `identifier`.
    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DuplicateTaskError> {
        let identifier = identifier.into();
        if self.tasks.contains_key(&identifier) {
            return Err(DuplicateTaskError(identifier));
        }
        self.tasks.insert(identifier, handler);
        Ok(())
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(
        &mut self,
        identifier: impl Into<String>,
        f: F,
    ) -> Result<(), DuplicateTaskError>
    where
        F: Fn(JsonValue, JobHelpers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = FnHandler(move |payload, helpers| -> BoxFuture<'static, _> {
            Box::pin(f(payload, helpers))
        });
        self.register(identifier, Arc::new(handler))
    }

    /// Looks up the handler for a task identifier.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<Arc<dyn TaskHandler>> {
        self.tasks.get(identifier).cloned()
    }

    /// The sorted list of task identifiers this registry supports.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.tasks.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.identifiers())
            .finish()
    }
}

/// Adapter turning an async closure into a [`TaskHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(JsonValue, JobHelpers) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    async fn run(&self, payload: JsonValue, helpers: JobHelpers) -> Result<(), BoxError> {
        (self.0)(payload, helpers).await
    }
}

/// Per-job context handed to a handler, built once per invocation.
///
/// Provides the job's metadata, the identity of the executing worker, a
/// job-scoped tracing span, and the store capability used to schedule
/// follow-up jobs.
#[derive(Clone)]
pub struct JobHelpers {
    job: Job,
    worker_id: WorkerId,
    store: Arc<dyn JobStore>,
    span: tracing::Span,
}

impl JobHelpers {
    pub(crate) fn new(
        job: Job,
        worker_id: WorkerId,
        store: Arc<dyn JobStore>,
        span: tracing::Span,
    ) -> Self {
        Self {
            job,
            worker_id,
            store,
            span,
        }
    }

    /// The job being executed, as leased from the store.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Identity of the worker executing the job.
    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// The job-scoped span. The handler future already runs inside it;
    /// spawn-away work can re-enter it explicitly.
    #[must_use]
    pub fn logger(&self) -> &tracing::Span {
        &self.span
    }

    /// Schedules a follow-up job through the worker's store.
    pub async fn add_job(
        &self,
        task_identifier: &str,
        payload: JsonValue,
        spec: &JobSpec,
    ) -> Result<Option<JobId>, BoxError> {
        self.store.add_job(task_identifier, payload, spec).await
    }
}

impl std::fmt::Debug for JobHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHelpers")
            .field("job_id", &self.job.id)
            .field("task_identifier", &self.job.task_identifier)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}
