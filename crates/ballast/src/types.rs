//! The data model: one struct per table in §3 of the design, plus the small
//! DTOs the runnables pass around in memory. Storage-agnostic — no `sqlx`
//! here, so this crate can be embedded without pulling in Postgres.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The canonical record of a unit of work. At most one of
/// `ScheduledExecution` / `ReadyExecution` / `ClaimedExecution` /
/// `BlockedExecution` / `FailedExecution` ever exists for a given job at a
/// time; a job with `finished_at` set has none of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue_name: String,
    pub class_name: String,
    pub arguments: Value,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    pub external_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// What the caller hands over to enqueue a new job. Deliberately does not
/// carry concurrency settings as separate arguments; those travel with the
/// job the way the original task decorator attaches them.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub class_name: String,
    pub arguments: Value,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub external_task_id: Option<String>,
    pub concurrency: Option<ConcurrencyControl>,
}

/// Concurrency admission settings a job carries, grounded in
/// `limits_concurrency` (key/limit/duration/group) from the original source.
#[derive(Debug, Clone)]
pub struct ConcurrencyControl {
    pub key: String,
    pub limit: i32,
    pub duration: chrono::Duration,
}

/// Job waiting for its `scheduled_at` to arrive.
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Job eligible to be claimed by a worker.
#[derive(Debug, Clone)]
pub struct ReadyExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub queue_name: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Job assigned to a worker process and currently running.
#[derive(Debug, Clone)]
pub struct ClaimedExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub process_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Job denied admission by a concurrency limit, waiting for a permit.
#[derive(Debug, Clone)]
pub struct BlockedExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub queue_name: String,
    pub priority: i32,
    pub concurrency_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Terminal failure record. Retryable via an explicit operator action.
#[derive(Debug, Clone)]
pub struct FailedExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub error: String,
    pub kind: crate::error::FailureKind,
    pub created_at: DateTime<Utc>,
}

/// The projection a worker actually needs to run a claimed job: just enough
/// to resolve the callable and invoke it, nothing about the row bookkeeping.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub claimed_execution_id: Uuid,
    pub job_id: Uuid,
    pub class_name: String,
    pub arguments: Value,
    pub queue_name: String,
    pub concurrency_key: Option<String>,
}

/// A live runnable: supervisor, dispatcher, worker, or scheduler.
#[derive(Debug, Clone)]
pub struct Process {
    pub id: Uuid,
    pub name: String,
    pub kind: ProcessKind,
    pub pid: i32,
    pub hostname: String,
    pub supervisor_id: Option<Uuid>,
    pub metadata: Value,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProcess {
    pub name: String,
    pub kind: ProcessKind,
    pub pid: i32,
    pub hostname: String,
    pub supervisor_id: Option<Uuid>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Supervisor,
    Dispatcher,
    Worker,
    Scheduler,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Supervisor => "supervisor",
            ProcessKind::Dispatcher => "dispatcher",
            ProcessKind::Worker => "worker",
            ProcessKind::Scheduler => "scheduler",
        }
    }
}

/// Named concurrency counter. `value` is the number of remaining permits.
#[derive(Debug, Clone)]
pub struct Semaphore {
    pub key: String,
    pub value: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A persisted recurring-task row, reconciled from configuration on boot
/// when `static_task` is true (versus admin-UI-created at runtime).
#[derive(Debug, Clone)]
pub struct RecurringTaskRow {
    pub id: Uuid,
    pub key: String,
    pub schedule: String,
    pub class_name: String,
    pub arguments: Value,
    pub queue_name: String,
    pub priority: i32,
    pub static_task: bool,
    pub description: Option<String>,
}

/// One per (task_key, run_at) fire. The unique constraint on that pair is
/// what makes concurrent schedulers enqueue exactly once.
#[derive(Debug, Clone)]
pub struct RecurringExecution {
    pub id: Uuid,
    pub task_key: String,
    pub run_at: DateTime<Utc>,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
}
