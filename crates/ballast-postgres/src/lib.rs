//! PostgreSQL implementation of the ballast job queue's [`JobStore`] trait.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` for contention-free claiming and dispatch.
//! - Named semaphores for concurrency-limited job groups, with blocked-row
//!   promotion on release.
//! - Process registration, heartbeats, pruning, and claim release on
//!   deregister.
//! - Exactly-once recurring-task enqueue via a `(task_key, run_at)` unique
//!   constraint race.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ballast_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/ballast").await?;
//! sqlx::migrate!("./migrations").run(&pool).await?;
//! let store = PgJobStore::new(pool);
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use ballast_core::{
    ClaimedJob, FailureKind, Job, JobStore, NewJob, NewProcess, Process, ProcessKind, QueueError,
    RecurringTaskRow, Result,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn db_err(err: sqlx::Error) -> QueueError {
    QueueError::Database(err.into())
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations. Call once at binary startup before any other
    /// method.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    Job {
        id: row.get("id"),
        queue_name: row.get("queue_name"),
        class_name: row.get("class_name"),
        arguments: row.get("arguments"),
        priority: row.get("priority"),
        scheduled_at: row.get("scheduled_at"),
        finished_at: row.get("finished_at"),
        concurrency_key: row.get("concurrency_key"),
        external_task_id: row.get("external_task_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_process(row: &sqlx::postgres::PgRow) -> Process {
    Process {
        id: row.get("id"),
        name: row.get("name"),
        kind: parse_process_kind(row.get("kind")),
        pid: row.get("pid"),
        hostname: row.get("hostname"),
        supervisor_id: row.get("supervisor_id"),
        metadata: row.get("metadata"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        created_at: row.get("created_at"),
    }
}

fn parse_process_kind(raw: &str) -> ProcessKind {
    match raw {
        "supervisor" => ProcessKind::Supervisor,
        "dispatcher" => ProcessKind::Dispatcher,
        "worker" => ProcessKind::Worker,
        "scheduler" => ProcessKind::Scheduler,
        other => panic!("unknown process kind in database: {other}"),
    }
}

fn row_to_recurring_task(row: &sqlx::postgres::PgRow) -> RecurringTaskRow {
    RecurringTaskRow {
        id: row.get("id"),
        key: row.get("key"),
        schedule: row.get("schedule"),
        class_name: row.get("class_name"),
        arguments: row.get("arguments"),
        queue_name: row.get("queue_name"),
        priority: row.get("priority"),
        static_task: row.get("static_task"),
        description: row.get("description"),
    }
}

/// Outcome of running admission control for one job inside a transaction.
enum Admission {
    Ready,
    Blocked { expires_at: DateTime<Utc> },
}

/// Acquire (or deny) a concurrency permit for `concurrency_key`, per §4.6.
/// With no key, every job is unconditionally admitted.
async fn admit(
    tx: &mut Transaction<'_, Postgres>,
    concurrency_key: Option<&str>,
    limit: Option<i32>,
    duration_secs: Option<i32>,
) -> Result<Admission> {
    let (Some(key), Some(limit), Some(duration_secs)) = (concurrency_key, limit, duration_secs)
    else {
        return Ok(Admission::Ready);
    };

    let now = Utc::now();
    let lease = Duration::seconds(duration_secs as i64);

    let existing =
        sqlx::query("SELECT value, permits_limit FROM semaphores WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;

    let current = match &existing {
        None => limit,
        Some(row) => row.get("value"),
    };

    if current > 0 {
        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO semaphores (key, value, permits_limit, lease_seconds, expires_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(key)
                .bind(limit - 1)
                .bind(limit)
                .bind(duration_secs)
                .bind(now + lease)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE semaphores SET value = value - 1, expires_at = $2, lease_seconds = $3 \
                     WHERE key = $1",
                )
                .bind(key)
                .bind(now + lease)
                .bind(duration_secs)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            }
        }
        Ok(Admission::Ready)
    } else {
        if existing.is_none() {
            sqlx::query(
                "INSERT INTO semaphores (key, value, permits_limit, lease_seconds, expires_at) \
                 VALUES ($1, 0, $2, $3, $4)",
            )
            .bind(key)
            .bind(limit)
            .bind(duration_secs)
            .bind(now + lease)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(Admission::Blocked {
            expires_at: now + lease,
        })
    }
}

/// Release one permit for `concurrency_key` and promote the
/// lowest-`(priority, job_id)` blocked job in that group, if the freed
/// permit admits it. Called whenever a job with a concurrency key finishes
/// or fails.
async fn release_and_promote(
    tx: &mut Transaction<'_, Postgres>,
    concurrency_key: &str,
) -> Result<()> {
    let row = sqlx::query(
        "UPDATE semaphores SET value = LEAST(value + 1, permits_limit) WHERE key = $1 \
         RETURNING value",
    )
    .bind(concurrency_key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(());
    };
    let mut available: i32 = row.get("value");

    while available > 0 {
        let candidate = sqlx::query(
            "SELECT id, job_id, queue_name, priority FROM blocked_executions \
             WHERE concurrency_key = $1 ORDER BY priority ASC, job_id ASC \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .bind(concurrency_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        let Some(candidate) = candidate else {
            break;
        };

        let blocked_id: Uuid = candidate.get("id");
        let job_id: Uuid = candidate.get("job_id");
        let queue_name: String = candidate.get("queue_name");
        let priority: i32 = candidate.get("priority");

        sqlx::query("DELETE FROM blocked_executions WHERE id = $1")
            .bind(blocked_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        insert_ready(tx, job_id, &queue_name, priority).await?;

        sqlx::query("UPDATE semaphores SET value = value - 1 WHERE key = $1")
            .bind(concurrency_key)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

        available -= 1;
    }

    Ok(())
}

async fn insert_ready(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    queue_name: &str,
    priority: i32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO ready_executions (id, job_id, queue_name, priority) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(queue_name)
    .bind(priority)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_blocked(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    queue_name: &str,
    priority: i32,
    concurrency_key: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO blocked_executions (id, job_id, queue_name, priority, concurrency_key, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(queue_name)
    .bind(priority)
    .bind(concurrency_key)
    .bind(expires_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_scheduled(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    queue_name: &str,
    priority: i32,
    scheduled_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO scheduled_executions (id, job_id, queue_name, priority, scheduled_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(queue_name)
    .bind(priority)
    .bind(scheduled_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Run admission control for a job and insert whichever sibling row the
/// outcome calls for (ready or blocked). Shared by enqueue's due-immediately
/// path, the dispatcher's batch promotion, and retry.
async fn prepare_for_execution(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    queue_name: &str,
    priority: i32,
    concurrency_key: Option<&str>,
    concurrency_limit: Option<i32>,
    concurrency_duration_secs: Option<i32>,
) -> Result<()> {
    match admit(
        tx,
        concurrency_key,
        concurrency_limit,
        concurrency_duration_secs,
    )
    .await?
    {
        Admission::Ready => insert_ready(tx, job_id, queue_name, priority).await,
        Admission::Blocked { expires_at } => {
            insert_blocked(
                tx,
                job_id,
                queue_name,
                priority,
                concurrency_key.expect("blocked admission always carries a key"),
                expires_at,
            )
            .await
        }
    }
}

/// Fail every `ClaimedExecution` owned by `process_id`, releasing each
/// job's concurrency permit, without deleting the process row itself.
async fn fail_claims_of(
    tx: &mut Transaction<'_, Postgres>,
    process_id: Uuid,
    reason: &str,
) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT ce.id, ce.job_id, j.concurrency_key FROM claimed_executions ce \
         JOIN jobs j ON j.id = ce.job_id WHERE ce.process_id = $1 FOR UPDATE OF ce",
    )
    .bind(process_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    let count = rows.len();
    for row in rows {
        let claimed_id: Uuid = row.get("id");
        let job_id: Uuid = row.get("job_id");
        let concurrency_key: Option<String> = row.get("concurrency_key");

        sqlx::query("DELETE FROM claimed_executions WHERE id = $1")
            .bind(claimed_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO failed_executions (id, job_id, error, kind) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(reason)
        .bind(FailureKind::NonRetryable.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        if let Some(key) = concurrency_key {
            release_and_promote(tx, &key).await?;
        }
    }
    Ok(count)
}

/// Release every `ClaimedExecution` owned by `process_id` back to
/// `ReadyExecution` (the graceful-deregister path, as opposed to the
/// terminal failure path `fail_claims_of` takes for pruning).
async fn release_claims_of(tx: &mut Transaction<'_, Postgres>, process_id: Uuid) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT ce.id, ce.job_id, j.queue_name, j.priority FROM claimed_executions ce \
         JOIN jobs j ON j.id = ce.job_id WHERE ce.process_id = $1 FOR UPDATE OF ce",
    )
    .bind(process_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    let count = rows.len();
    for row in rows {
        let claimed_id: Uuid = row.get("id");
        let job_id: Uuid = row.get("job_id");
        let queue_name: String = row.get("queue_name");
        let priority: i32 = row.get("priority");

        sqlx::query("DELETE FROM claimed_executions WHERE id = $1")
            .bind(claimed_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        insert_ready(tx, job_id, &queue_name, priority).await?;
    }
    Ok(count)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_id = Uuid::new_v4();
        let (concurrency_key, concurrency_limit, concurrency_duration) = match &job.concurrency {
            Some(c) => (
                Some(c.key.clone()),
                Some(c.limit),
                Some(c.duration.num_seconds() as i32),
            ),
            None => (None, None, None),
        };

        let row = sqlx::query(
            "INSERT INTO jobs \
                (id, queue_name, class_name, arguments, priority, scheduled_at, \
                 concurrency_key, concurrency_limit, concurrency_duration_seconds, external_task_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING *",
        )
        .bind(job_id)
        .bind(&job.queue_name)
        .bind(&job.class_name)
        .bind(&job.arguments)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(&concurrency_key)
        .bind(concurrency_limit)
        .bind(concurrency_duration)
        .bind(&job.external_task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| QueueError::Enqueue(e.into()))?;

        let now = Utc::now();
        let due = job.scheduled_at.map(|at| at <= now).unwrap_or(true);
        if due {
            prepare_for_execution(
                &mut tx,
                job_id,
                &job.queue_name,
                job.priority,
                concurrency_key.as_deref(),
                concurrency_limit,
                concurrency_duration,
            )
            .await?;
        } else {
            insert_scheduled(
                &mut tx,
                job_id,
                &job.queue_name,
                job.priority,
                job.scheduled_at.unwrap(),
            )
            .await?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(job_id = %job_id, class_name = %job.class_name, due, "enqueued job");
        Ok(row_to_job(&row))
    }

    async fn dispatch_next_batch(&self, batch_size: i64) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let due = sqlx::query(
            "SELECT se.id, se.job_id, se.queue_name, se.priority, \
                    j.concurrency_key, j.concurrency_limit, j.concurrency_duration_seconds \
             FROM scheduled_executions se JOIN jobs j ON j.id = se.job_id \
             WHERE se.scheduled_at <= now() \
             ORDER BY se.priority ASC, se.job_id ASC \
             FOR UPDATE OF se SKIP LOCKED LIMIT $1",
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let count = due.len();
        for row in due {
            let scheduled_id: Uuid = row.get("id");
            let job_id: Uuid = row.get("job_id");
            let queue_name: String = row.get("queue_name");
            let priority: i32 = row.get("priority");
            let concurrency_key: Option<String> = row.get("concurrency_key");
            let concurrency_limit: Option<i32> = row.get("concurrency_limit");
            let concurrency_duration: Option<i32> = row.get("concurrency_duration_seconds");

            sqlx::query("DELETE FROM scheduled_executions WHERE id = $1")
                .bind(scheduled_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            prepare_for_execution(
                &mut tx,
                job_id,
                &queue_name,
                priority,
                concurrency_key.as_deref(),
                concurrency_limit,
                concurrency_duration,
            )
            .await?;
        }

        tx.commit().await.map_err(db_err)?;
        if count > 0 {
            debug!(count, "dispatched scheduled executions");
        }
        Ok(count)
    }

    async fn claim_ready(
        &self,
        process_id: Option<Uuid>,
        queues: &[String],
        limit: i64,
    ) -> Result<Vec<ClaimedJob>> {
        let Some(process_id) = process_id else {
            return Ok(Vec::new());
        };
        if limit <= 0 || queues.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut claimed = Vec::new();
        let mut remaining = limit;

        for queue_name in queues {
            if remaining <= 0 {
                break;
            }

            let candidates = sqlx::query(
                "SELECT id, job_id FROM ready_executions WHERE queue_name = $1 \
                 ORDER BY priority ASC, created_at ASC FOR UPDATE SKIP LOCKED LIMIT $2",
            )
            .bind(queue_name)
            .bind(remaining)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

            for row in candidates {
                let ready_id: Uuid = row.get("id");
                let job_id: Uuid = row.get("job_id");
                let claimed_id = Uuid::new_v4();

                sqlx::query("DELETE FROM ready_executions WHERE id = $1")
                    .bind(ready_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                sqlx::query(
                    "INSERT INTO claimed_executions (id, job_id, process_id) VALUES ($1, $2, $3)",
                )
                .bind(claimed_id)
                .bind(job_id)
                .bind(process_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                let job_row = sqlx::query(
                    "SELECT class_name, arguments, queue_name, concurrency_key FROM jobs WHERE id = $1",
                )
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

                claimed.push(ClaimedJob {
                    claimed_execution_id: claimed_id,
                    job_id,
                    class_name: job_row.get("class_name"),
                    arguments: job_row.get("arguments"),
                    queue_name: job_row.get("queue_name"),
                    concurrency_key: job_row.get("concurrency_key"),
                });
                remaining -= 1;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(claimed)
    }

    async fn mark_finished(
        &self,
        claimed_execution_id: Uuid,
        job_id: Uuid,
        preserve_finished_jobs: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let concurrency_key: Option<String> =
            sqlx::query_scalar("SELECT concurrency_key FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .flatten();

        sqlx::query("DELETE FROM claimed_executions WHERE id = $1")
            .bind(claimed_execution_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if preserve_finished_jobs {
            sqlx::query("UPDATE jobs SET finished_at = now(), updated_at = now() WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        } else {
            sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        if let Some(key) = concurrency_key {
            release_and_promote(&mut tx, &key).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        claimed_execution_id: Uuid,
        job_id: Uuid,
        concurrency_key: Option<&str>,
        error: &str,
        kind: FailureKind,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM claimed_executions WHERE id = $1")
            .bind(claimed_execution_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO failed_executions (id, job_id, error, kind) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(error)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(key) = concurrency_key {
            release_and_promote(&mut tx, key).await?;
        }

        tx.commit().await.map_err(db_err)?;
        warn!(job_id = %job_id, kind = kind.as_str(), "job failed");
        Ok(())
    }

    async fn retry_failed_execution(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deleted = sqlx::query("DELETE FROM failed_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() == 0 {
            return Err(QueueError::Configuration(format!(
                "job {job_id} has no failed execution to retry"
            )));
        }

        let job = sqlx::query(
            "SELECT queue_name, priority, scheduled_at, concurrency_key, concurrency_limit, \
                    concurrency_duration_seconds \
             FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let queue_name: String = job.get("queue_name");
        let priority: i32 = job.get("priority");
        let scheduled_at: Option<DateTime<Utc>> = job.get("scheduled_at");
        let concurrency_key: Option<String> = job.get("concurrency_key");
        let concurrency_limit: Option<i32> = job.get("concurrency_limit");
        let concurrency_duration: Option<i32> = job.get("concurrency_duration_seconds");

        let now = Utc::now();
        if scheduled_at.map(|at| at > now).unwrap_or(false) {
            insert_scheduled(
                &mut tx,
                job_id,
                &queue_name,
                priority,
                scheduled_at.unwrap(),
            )
            .await?;
        } else {
            prepare_for_execution(
                &mut tx,
                job_id,
                &queue_name,
                priority,
                concurrency_key.as_deref(),
                concurrency_limit,
                concurrency_duration,
            )
            .await?;
        }

        tx.commit().await.map_err(db_err)?;
        info!(job_id = %job_id, "retried failed execution");
        Ok(())
    }

    async fn register_process(&self, process: NewProcess) -> Result<Process> {
        let row = sqlx::query(
            "INSERT INTO processes (id, name, kind, pid, hostname, supervisor_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&process.name)
        .bind(process.kind.as_str())
        .bind(process.pid)
        .bind(&process.hostname)
        .bind(process.supervisor_id)
        .bind(&process.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        info!(name = %process.name, kind = process.kind.as_str(), "process registered");
        Ok(row_to_process(&row))
    }

    async fn heartbeat_process(&self, process_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE processes SET last_heartbeat_at = now() WHERE id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn deregister_process(&self, process_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let descendants: Vec<Uuid> = sqlx::query_scalar(
            "WITH RECURSIVE tree AS ( \
                SELECT id FROM processes WHERE supervisor_id = $1 \
                UNION ALL \
                SELECT p.id FROM processes p JOIN tree t ON p.supervisor_id = t.id \
             ) SELECT id FROM tree",
        )
        .bind(process_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for id in &descendants {
            release_claims_of(&mut tx, *id).await?;
        }
        release_claims_of(&mut tx, process_id).await?;

        let mut ids = descendants;
        ids.push(process_id);
        sqlx::query("DELETE FROM processes WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn prune_dead_processes(
        &self,
        alive_threshold: chrono::Duration,
        excluding: Option<Uuid>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let cutoff = Utc::now() - alive_threshold;

        let stale: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM processes WHERE last_heartbeat_at < $1 \
             AND ($2::uuid IS NULL OR id <> $2) FOR UPDATE SKIP LOCKED",
        )
        .bind(cutoff)
        .bind(excluding)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let count = stale.len();
        for id in &stale {
            fail_claims_of(
                &mut tx,
                *id,
                "process pruned: heartbeat exceeded alive threshold",
            )
            .await?;

            let descendants: Vec<Uuid> = sqlx::query_scalar(
                "WITH RECURSIVE tree AS ( \
                    SELECT id FROM processes WHERE supervisor_id = $1 \
                    UNION ALL \
                    SELECT p.id FROM processes p JOIN tree t ON p.supervisor_id = t.id \
                 ) SELECT id FROM tree",
            )
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
            for descendant in &descendants {
                fail_claims_of(
                    &mut tx,
                    *descendant,
                    "process pruned: parent supervisor pruned",
                )
                .await?;
            }

            let mut ids = descendants;
            ids.push(*id);
            sqlx::query("DELETE FROM processes WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        if count > 0 {
            info!(count, "pruned dead processes");
        }
        Ok(count)
    }

    async fn fail_orphaned_claims(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT ce.id, ce.job_id, j.concurrency_key FROM claimed_executions ce \
             JOIN jobs j ON j.id = ce.job_id WHERE ce.process_id IS NULL FOR UPDATE OF ce SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let count = rows.len();
        for row in rows {
            let claimed_id: Uuid = row.get("id");
            let job_id: Uuid = row.get("job_id");
            let concurrency_key: Option<String> = row.get("concurrency_key");

            sqlx::query("DELETE FROM claimed_executions WHERE id = $1")
                .bind(claimed_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO failed_executions (id, job_id, error, kind) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(job_id)
            .bind("claimed execution orphaned: owning process_id is null")
            .bind(FailureKind::NonRetryable.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(key) = concurrency_key {
                release_and_promote(&mut tx, &key).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        if count > 0 {
            warn!(count, "failed orphaned claimed executions");
        }
        Ok(count)
    }

    async fn known_queue_names(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT queue_name FROM ready_executions \
             UNION SELECT queue_name FROM scheduled_executions \
             UNION SELECT queue_name FROM recurring_tasks",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows)
    }

    async fn paused_queue_names(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT queue_name FROM pauses")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().collect())
    }

    async fn reconcile_static_recurring_tasks(&self, tasks: &[RecurringTaskRow]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for task in tasks {
            sqlx::query(
                "INSERT INTO recurring_tasks (id, key, schedule, class_name, arguments, queue_name, priority, static_task, description) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, true, $8) \
                 ON CONFLICT (key) DO UPDATE SET \
                    schedule = EXCLUDED.schedule, \
                    class_name = EXCLUDED.class_name, \
                    arguments = EXCLUDED.arguments, \
                    queue_name = EXCLUDED.queue_name, \
                    priority = EXCLUDED.priority, \
                    static_task = true, \
                    description = EXCLUDED.description",
            )
            .bind(Uuid::new_v4())
            .bind(&task.key)
            .bind(&task.schedule)
            .bind(&task.class_name)
            .bind(&task.arguments)
            .bind(&task.queue_name)
            .bind(task.priority)
            .bind(&task.description)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn all_recurring_tasks(&self) -> Result<Vec<RecurringTaskRow>> {
        let rows = sqlx::query("SELECT * FROM recurring_tasks")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_recurring_task).collect())
    }

    async fn enqueue_recurring_if_due(
        &self,
        task_key: &str,
        run_at: DateTime<Utc>,
        class_name: &str,
        arguments: serde_json::Value,
        queue_name: &str,
        priority: i32,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, queue_name, class_name, arguments, priority) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id)
        .bind(queue_name)
        .bind(class_name)
        .bind(&arguments)
        .bind(priority)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let claimed = sqlx::query(
            "INSERT INTO recurring_executions (id, task_key, run_at, job_id) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (task_key, run_at) DO NOTHING RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(task_key)
        .bind(run_at)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if claimed.is_none() {
            // Another scheduler already claimed this (task_key, run_at);
            // rolling back undoes the job insert above too.
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        insert_ready(&mut tx, job_id, queue_name, priority).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn expire_blocked_executions(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT id, job_id, queue_name, priority FROM blocked_executions \
             WHERE expires_at < now() FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let count = rows.len();
        for row in rows {
            let blocked_id: Uuid = row.get("id");
            let job_id: Uuid = row.get("job_id");
            let queue_name: String = row.get("queue_name");
            let priority: i32 = row.get("priority");

            sqlx::query("DELETE FROM blocked_executions WHERE id = $1")
                .bind(blocked_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            insert_ready(&mut tx, job_id, &queue_name, priority).await?;
        }

        tx.commit().await.map_err(db_err)?;
        if count > 0 {
            debug!(count, "expired blocked executions promoted");
        }
        Ok(count)
    }

    async fn sweep_finished_jobs(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                SELECT id FROM jobs WHERE finished_at IS NOT NULL AND finished_at < $1 \
                LIMIT $2 \
             )",
        )
        .bind(older_than)
        .bind(batch_size)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            debug!(deleted, "swept finished jobs");
        }
        Ok(deleted)
    }
}
