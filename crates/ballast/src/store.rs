//! The [`JobStore`] trait: every durable state transition the rest of the
//! crate needs, expressed as one method per transaction. A storage backend
//! (Postgres today, see `ballast-postgres`) implements this once; every
//! runnable is generic over it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{FailureKind, Result};
use crate::types::{ClaimedJob, Job, NewJob, NewProcess, Process, RecurringTaskRow};

/// Everything a worker/dispatcher/scheduler/supervisor needs from the
/// database, abstracted behind one trait so the runnables in this crate
/// never see SQL.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a Job and its first sibling execution row (`ScheduledExecution`
    /// if not yet due, otherwise admitted straight to `ReadyExecution` or
    /// `BlockedExecution` per the concurrency-control outcome).
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Promote up to `batch_size` due `ScheduledExecution`s to
    /// `ReadyExecution`/`BlockedExecution`. Returns the number dispatched.
    async fn dispatch_next_batch(&self, batch_size: i64) -> Result<usize>;

    /// Claim up to `limit` ready executions across `queues`, in the order
    /// the list is given, atomically transferring them to claimed
    /// executions owned by `process_id`. Returns an empty vector without
    /// touching the database if `process_id` is not a currently-registered
    /// process.
    async fn claim_ready(
        &self,
        process_id: Option<Uuid>,
        queues: &[String],
        limit: i64,
    ) -> Result<Vec<ClaimedJob>>;

    /// Mark the job behind `claimed_execution_id` as finished. Deletes the
    /// `ClaimedExecution`; deletes the `Job` outright instead of setting
    /// `finished_at` when `preserve_finished_jobs` is false.
    async fn mark_finished(
        &self,
        claimed_execution_id: Uuid,
        job_id: Uuid,
        preserve_finished_jobs: bool,
    ) -> Result<()>;

    /// Record a failure: delete the `ClaimedExecution`, insert a
    /// `FailedExecution`, and release the job's concurrency permit (if any),
    /// promoting the next `BlockedExecution` in that group when possible.
    async fn mark_failed(
        &self,
        claimed_execution_id: Uuid,
        job_id: Uuid,
        concurrency_key: Option<&str>,
        error: &str,
        kind: FailureKind,
    ) -> Result<()>;

    /// Operator action: delete the `FailedExecution` and re-run
    /// `prepare_for_execution` for the job (scheduled, ready, or blocked
    /// depending on `scheduled_at` and concurrency admission).
    async fn retry_failed_execution(&self, job_id: Uuid) -> Result<()>;

    /// Register a runnable. Called once at boot by each process.
    async fn register_process(&self, process: NewProcess) -> Result<Process>;

    /// Refresh `last_heartbeat_at`. Returns `false` if the process row no
    /// longer exists (it was pruned), in which case the caller must treat
    /// itself as deregistered.
    async fn heartbeat_process(&self, process_id: Uuid) -> Result<bool>;

    /// Deregister a process, releasing any `ClaimedExecution`s it owned
    /// back to `ReadyExecution` in the same transaction. For a supervisor,
    /// first deregisters every process whose `supervisor_id` points at it.
    async fn deregister_process(&self, process_id: Uuid) -> Result<()>;

    /// Fail and deregister every process whose heartbeat is older than
    /// `alive_threshold`, except `excluding`. Safe to call with
    /// `excluding = None`.
    async fn prune_dead_processes(
        &self,
        alive_threshold: chrono::Duration,
        excluding: Option<Uuid>,
    ) -> Result<usize>;

    /// Safety net distinct from pruning: fail any `ClaimedExecution` whose
    /// `process_id` is already `NULL` (left behind by a release race or an
    /// older build without the deregister hook).
    async fn fail_orphaned_claims(&self) -> Result<usize>;

    /// Distinct queue names known from `ReadyExecution` rows plus any
    /// statically configured queue, used to resolve the `"*"` pattern.
    async fn known_queue_names(&self) -> Result<Vec<String>>;

    /// Queue names currently paused; excluded from worker claim scope but
    /// not from enqueue.
    async fn paused_queue_names(&self) -> Result<HashSet<String>>;

    /// Upsert the `static` recurring tasks by key from configuration.
    async fn reconcile_static_recurring_tasks(&self, tasks: &[RecurringTaskRow]) -> Result<()>;

    /// All recurring tasks (static and admin-created) the scheduler should
    /// keep a timetable for.
    async fn all_recurring_tasks(&self) -> Result<Vec<RecurringTaskRow>>;

    /// Idempotently enqueue one fire of a recurring task. Returns `false`
    /// (without enqueuing) if a `RecurringExecution` for `(task_key, run_at)`
    /// already exists — the race a second concurrent scheduler loses.
    async fn enqueue_recurring_if_due(
        &self,
        task_key: &str,
        run_at: DateTime<Utc>,
        class_name: &str,
        arguments: serde_json::Value,
        queue_name: &str,
        priority: i32,
    ) -> Result<bool>;

    /// Promote any `BlockedExecution` whose lease has expired regardless of
    /// the semaphore's counted value — a safety net for leaked permits.
    async fn expire_blocked_executions(&self) -> Result<usize>;

    /// Delete finished jobs older than `older_than`, in batches of at most
    /// `batch_size`. Returns the number deleted.
    async fn sweep_finished_jobs(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<usize>;
}
