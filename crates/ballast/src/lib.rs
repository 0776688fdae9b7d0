//! # ballast-core
//!
//! A durable, database-backed background job queue modeled on the
//! Rails/Solid Queue design: jobs are rows, not messages, so the queue's
//! state survives process crashes and is inspectable with plain SQL.
//!
//! ## Core Concepts
//!
//! A [`types::Job`] starts life with exactly one sibling row describing its
//! current stage in the pipeline:
//!
//! ```text
//! enqueue
//!    │
//!    ▼
//! ScheduledExecution (run_at in the future)
//!    │  scheduler promotes when due
//!    ▼
//! ReadyExecution ──────────────┐
//!    │  worker claims            │ concurrency limit hit
//!    ▼                           ▼
//! ClaimedExecution          BlockedExecution
//!    │  finishes                 │  semaphore releases
//!    ├─success──► (row deleted)  │
//!    └─failure──► FailedExecution◄┘ promoted back to ReadyExecution
//! ```
//!
//! Exactly one sibling row exists per job at any time, enforced by a unique
//! constraint on `job_id` in each sibling table. This crate defines that
//! state machine and the runnables (worker, dispatcher, scheduler,
//! supervisor) that drive it, in terms of the storage-agnostic
//! [`store::JobStore`] trait. A concrete backend (e.g. `ballast-postgres`)
//! implements the trait; this crate never talks to a database directly.
//!
//! ## What This Is Not
//!
//! ballast-core is **not**:
//! - A message broker (no at-least-once redelivery to multiple consumers)
//! - An in-memory task scheduler (every transition is a durable row change)
//! - A distributed workflow/saga engine

mod config;
mod dispatcher;
mod error;
mod job_macro;
mod poller;
mod pool;
mod process;
mod queues;
mod registry;
mod scheduler;
mod store;
mod supervisor;
mod types;
mod worker;

pub use config::{
    ChildKind, ChildSpec, Configuration, DispatcherConfig, RecurringTaskConfig, SupervisorConfig,
    WorkerConfig,
};
pub use dispatcher::Dispatcher;
pub use error::{FailureKind, QueueError, Result};
pub use job_macro::ToArguments;
pub use poller::{run_loop, PollerHandle};
pub use pool::TaskPool;
pub use process::{hostname, process_name, ProcessHandle};
pub use queues::QueuePattern;
pub use registry::{Callable, CommandRegistry, DeserializationError};
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use supervisor::{parse_child_role, Supervisor, CHILD_ROLE_ENV, SUPERVISOR_PID_ENV};
pub use types::{
    BlockedExecution, ClaimedExecution, ClaimedJob, ConcurrencyControl, FailedExecution, Job,
    NewJob, NewProcess, Process, ProcessKind, ReadyExecution, RecurringExecution, RecurringTaskRow,
    ScheduledExecution, Semaphore,
};
pub use worker::Worker;

pub use async_trait::async_trait;
