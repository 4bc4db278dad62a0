//! Single-worker execution loop for the shared job queue.
//!
//! This crate provides the worker component that executes queued jobs in
//! distributed deployments. Workers coordinate exclusively through the
//! shared queue database: each one continuously leases ready jobs, runs the
//! registered task handler, reports success or failure back to the store,
//! and periodically reclaims leases abandoned by crashed peers.
//!
//! A worker is a state machine with one foreground loop and one background
//! timer. The control surface (`nudge`, `release`, the completion handle)
//! and a broadcast event bus expose its lifecycle to the host process; a
//! pool simply spawns N independent workers over one store and one bus.

mod config;
mod error;
mod events;
mod store;
mod tasks;
mod worker;
mod worker_id;

pub use queue_db::{Job, JobId, JobSpec};

pub use self::{
    config::{ForbiddenFlags, WorkerOptions, defaults},
    error::FatalError,
    events::{EventBus, WorkerEvent},
    store::{BoxError, JobStore},
    tasks::{DuplicateTaskError, JobHelpers, TaskError, TaskHandler, TaskRegistry},
    worker::{Completion, CompletionResult, Worker},
    worker_id::WorkerId,
};
