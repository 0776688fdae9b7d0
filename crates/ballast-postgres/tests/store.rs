//! Integration tests against a real Postgres, exercising the testable
//! properties and end-to-end scenarios. Each test gets a freshly migrated,
//! isolated database via `#[sqlx::test]`.

use ballast_core::{ConcurrencyControl, FailureKind, JobStore, NewJob, NewProcess, ProcessKind};
use ballast_postgres::PgJobStore;
use serde_json::json;
use sqlx::PgPool;

fn new_job(queue: &str) -> NewJob {
    NewJob {
        queue_name: queue.to_string(),
        class_name: "tests.dummy.incr".to_string(),
        arguments: json!({}),
        priority: 0,
        scheduled_at: None,
        external_task_id: None,
        concurrency: None,
    }
}

async fn register_worker(store: &PgJobStore, name: &str) -> uuid::Uuid {
    register_process_with_supervisor(store, name, ProcessKind::Worker, None).await
}

async fn register_process_with_supervisor(
    store: &PgJobStore,
    name: &str,
    kind: ProcessKind,
    supervisor_id: Option<uuid::Uuid>,
) -> uuid::Uuid {
    store
        .register_process(NewProcess {
            name: name.to_string(),
            kind,
            pid: std::process::id() as i32,
            hostname: "test-host".to_string(),
            supervisor_id,
            metadata: json!({}),
        })
        .await
        .unwrap()
        .id
}

#[sqlx::test(migrations = "./migrations")]
async fn enqueue_creates_exactly_one_ready_execution(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();

    let known = store.known_queue_names().await.unwrap();
    assert_eq!(known, vec!["default".to_string()]);

    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, job.id);

    // claimed, not ready: a second claim attempt finds nothing.
    let second = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert!(second.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn claim_with_no_process_returns_empty_and_inserts_nothing(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.enqueue(new_job("default")).await.unwrap();

    let claimed = store
        .claim_ready(None, &["default".to_string()], 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    // The job is still ready for a real process to pick up.
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn finish_with_preserve_leaves_only_a_finished_job(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();

    store
        .mark_finished(claimed[0].claimed_execution_id, job.id, true)
        .await
        .unwrap();

    let row: (Option<chrono::DateTime<chrono::Utc>>,) =
        sqlx::query_as("SELECT finished_at FROM jobs WHERE id = $1")
            .bind(job.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert!(row.0.is_some());

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM claimed_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn finish_without_preserve_deletes_the_job(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();

    store
        .mark_finished(claimed[0].claimed_execution_id, job.id, false)
        .await
        .unwrap();

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs WHERE id = $1")
        .bind(job.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn failed_execution_can_be_retried_back_to_ready(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();

    store
        .mark_failed(
            claimed[0].claimed_execution_id,
            job.id,
            None,
            "ZeroDivisionError: division by zero",
            FailureKind::Retryable,
        )
        .await
        .unwrap();

    let failed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM failed_executions WHERE job_id = $1")
            .bind(job.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(failed, 1);

    store.retry_failed_execution(job.id).await.unwrap();

    let failed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM failed_executions WHERE job_id = $1")
            .bind(job.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(failed, 0);

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions WHERE job_id = $1")
        .bind(job.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrency_limit_blocks_then_promotes_on_finish(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let concurrency = ConcurrencyControl {
        key: "k".to_string(),
        limit: 1,
        duration: chrono::Duration::minutes(3),
    };

    let mut job = new_job("default");
    job.concurrency = Some(concurrency.clone());
    let first = store.enqueue(job).await.unwrap();

    // Distinct priorities make promotion order deterministic regardless of
    // the (random) job_id tiebreak, matching the lowest-(priority, job_id)
    // promotion rule.
    let mut job = new_job("default");
    job.concurrency = Some(concurrency.clone());
    job.priority = 0;
    let second = store.enqueue(job).await.unwrap();

    let mut job = new_job("default");
    job.concurrency = Some(concurrency);
    job.priority = 1;
    let third = store.enqueue(job).await.unwrap();

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let blocked: i64 = sqlx::query_scalar("SELECT count(*) FROM blocked_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
    assert_eq!(blocked, 2);

    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, first.id);

    store
        .mark_finished(claimed[0].claimed_execution_id, first.id, true)
        .await
        .unwrap();

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let blocked: i64 = sqlx::query_scalar("SELECT count(*) FROM blocked_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
    assert_eq!(blocked, 1);

    let promoted = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].job_id, second.id);

    store
        .mark_finished(promoted[0].claimed_execution_id, second.id, true)
        .await
        .unwrap();

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let blocked: i64 = sqlx::query_scalar("SELECT count(*) FROM blocked_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
    assert_eq!(blocked, 0);

    let last = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(last[0].job_id, third.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn heartbeat_is_null_safe_after_the_process_row_is_gone(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let process_id = register_worker(&store, "w-1").await;

    assert!(store.heartbeat_process(process_id).await.unwrap());

    store.deregister_process(process_id).await.unwrap();

    assert!(!store.heartbeat_process(process_id).await.unwrap());
    // Calling again after the row is already gone must not raise.
    assert!(!store.heartbeat_process(process_id).await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
async fn deregister_releases_claims_back_to_ready(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.enqueue(new_job("default")).await.unwrap();
    store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    store.deregister_process(process_id).await.unwrap();

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let claimed_remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM claimed_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 2);
    assert_eq!(claimed_remaining, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn deregistering_a_supervisor_cascades_to_its_children(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let supervisor_id =
        register_process_with_supervisor(&store, "sup-1", ProcessKind::Supervisor, None).await;
    let child_id =
        register_process_with_supervisor(&store, "w-1", ProcessKind::Worker, Some(supervisor_id))
            .await;
    let grandchild_id =
        register_process_with_supervisor(&store, "w-1-child", ProcessKind::Worker, Some(child_id))
            .await;

    store.deregister_process(supervisor_id).await.unwrap();

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM processes")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0, "supervisor and both descendants must be gone");

    let still_there: i64 =
        sqlx::query_scalar("SELECT count(*) FROM processes WHERE id IN ($1, $2, $3)")
            .bind(supervisor_id)
            .bind(child_id)
            .bind(grandchild_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(still_there, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn pruning_a_dead_supervisor_cascades_to_its_children(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let supervisor_id =
        register_process_with_supervisor(&store, "sup-1", ProcessKind::Supervisor, None).await;
    let child_id =
        register_process_with_supervisor(&store, "w-1", ProcessKind::Worker, Some(supervisor_id))
            .await;

    sqlx::query(
        "UPDATE processes SET last_heartbeat_at = now() - interval '10 minutes' WHERE id = $1",
    )
    .bind(supervisor_id)
    .execute(store.pool())
    .await
    .unwrap();

    let pruned = store
        .prune_dead_processes(chrono::Duration::minutes(5), None)
        .await
        .unwrap();
    assert_eq!(
        pruned, 1,
        "prune_dead_processes counts the dead roots it finds, cascades handle the rest"
    );

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM processes WHERE id IN ($1, $2)")
        .bind(supervisor_id)
        .bind(child_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(
        remaining, 0,
        "the live child must be cascaded away with its dead supervisor"
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn prune_fails_claims_of_dead_processes_and_removes_them(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.enqueue(new_job("default")).await.unwrap();
    store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    // Simulate a stale heartbeat by backdating it directly.
    sqlx::query(
        "UPDATE processes SET last_heartbeat_at = now() - interval '10 minutes' WHERE id = $1",
    )
    .bind(process_id)
    .execute(store.pool())
    .await
    .unwrap();

    let pruned = store
        .prune_dead_processes(chrono::Duration::minutes(5), None)
        .await
        .unwrap();
    assert_eq!(pruned, 1);

    let processes_remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM processes")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let claimed_remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM claimed_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let failed: i64 = sqlx::query_scalar("SELECT count(*) FROM failed_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(processes_remaining, 0);
    assert_eq!(claimed_remaining, 0);
    assert_eq!(failed, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn prune_excludes_the_given_process(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let keep = register_worker(&store, "keep-me").await;
    let stale = register_worker(&store, "prune-me").await;

    sqlx::query("UPDATE processes SET last_heartbeat_at = now() - interval '10 minutes' WHERE id IN ($1, $2)")
        .bind(keep)
        .bind(stale)
        .execute(store.pool())
        .await
        .unwrap();

    let pruned = store
        .prune_dead_processes(chrono::Duration::minutes(5), Some(keep))
        .await
        .unwrap();
    assert_eq!(pruned, 1);

    let remaining: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM processes")
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, vec![keep]);
}

#[sqlx::test(migrations = "./migrations")]
async fn fail_orphaned_claims_handles_null_process_id(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();

    // Deleting the process directly (bypassing deregister_process) leaves
    // an orphaned claim with process_id NULL via ON DELETE SET NULL,
    // exactly the case fail_orphaned_claims exists for.
    sqlx::query("DELETE FROM processes WHERE id = $1")
        .bind(process_id)
        .execute(store.pool())
        .await
        .unwrap();

    let failed_count = store.fail_orphaned_claims().await.unwrap();
    assert_eq!(failed_count, 1);

    let failed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM failed_executions WHERE job_id = $1")
            .bind(job.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(failed, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn dispatch_promotes_due_scheduled_executions(pool: PgPool) {
    let store = PgJobStore::new(pool);

    // A job scheduled for the future still sits in scheduled_executions...
    let mut due_later = new_job("default");
    due_later.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    store.enqueue(due_later).await.unwrap();

    // ...but one whose scheduled_at has already elapsed (simulated here by
    // backdating it directly, the way a job scheduled slightly ahead of a
    // slow dispatcher tick would look by the time dispatch runs) is the one
    // dispatch_next_batch must promote to ready.
    let mut due_now = new_job("default");
    due_now.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::seconds(30));
    let due_now = store.enqueue(due_now).await.unwrap();
    sqlx::query("UPDATE scheduled_executions SET scheduled_at = now() - interval '5 seconds' WHERE job_id = $1")
        .bind(due_now.id)
        .execute(store.pool())
        .await
        .unwrap();

    let dispatched = store.dispatch_next_batch(10).await.unwrap();
    assert_eq!(dispatched, 1);

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let scheduled: i64 = sqlx::query_scalar("SELECT count(*) FROM scheduled_executions")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
    assert_eq!(scheduled, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn recurring_fire_is_idempotent_across_racing_schedulers(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let run_at = chrono::Utc::now();

    let first = store
        .enqueue_recurring_if_due(
            "daily-report",
            run_at,
            "reports.daily",
            json!({}),
            "default",
            0,
        )
        .await
        .unwrap();
    let second = store
        .enqueue_recurring_if_due(
            "daily-report",
            run_at,
            "reports.daily",
            json!({}),
            "default",
            0,
        )
        .await
        .unwrap();

    assert!(first);
    assert!(!second);

    let jobs: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let executions: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM recurring_executions WHERE task_key = 'daily-report'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(jobs, 1);
    assert_eq!(executions, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn paused_queues_are_listed_separately_from_known_queues(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.enqueue(new_job("default")).await.unwrap();
    store.enqueue(new_job("low")).await.unwrap();

    sqlx::query("INSERT INTO pauses (queue_name) VALUES ('low')")
        .execute(store.pool())
        .await
        .unwrap();

    let known = store.known_queue_names().await.unwrap();
    let paused = store.paused_queue_names().await.unwrap();

    assert!(known.contains(&"default".to_string()));
    assert!(known.contains(&"low".to_string()));
    assert!(paused.contains("low"));
    assert!(!paused.contains("default"));
}

#[sqlx::test(migrations = "./migrations")]
async fn expire_blocked_executions_is_a_safety_net_regardless_of_semaphore_value(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let concurrency = ConcurrencyControl {
        key: "leaked".to_string(),
        limit: 1,
        duration: chrono::Duration::seconds(1),
    };

    let mut job = new_job("default");
    job.concurrency = Some(concurrency.clone());
    store.enqueue(job).await.unwrap();

    let mut job = new_job("default");
    job.concurrency = Some(concurrency);
    let blocked_job = store.enqueue(job).await.unwrap();

    sqlx::query(
        "UPDATE blocked_executions SET expires_at = now() - interval '1 second' WHERE job_id = $1",
    )
    .bind(blocked_job.id)
    .execute(store.pool())
    .await
    .unwrap();

    let promoted = store.expire_blocked_executions().await.unwrap();
    assert_eq!(promoted, 1);

    let ready: i64 = sqlx::query_scalar("SELECT count(*) FROM ready_executions WHERE job_id = $1")
        .bind(blocked_job.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(ready, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn sweep_finished_jobs_deletes_only_old_enough_rows(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.enqueue(new_job("default")).await.unwrap();
    let process_id = register_worker(&store, "w-1").await;
    let claimed = store
        .claim_ready(Some(process_id), &["default".to_string()], 10)
        .await
        .unwrap();
    store
        .mark_finished(claimed[0].claimed_execution_id, job.id, true)
        .await
        .unwrap();

    sqlx::query("UPDATE jobs SET finished_at = now() - interval '2 days' WHERE id = $1")
        .bind(job.id)
        .execute(store.pool())
        .await
        .unwrap();

    let deleted = store
        .sweep_finished_jobs(chrono::Utc::now() - chrono::Duration::days(1), 100)
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn reconcile_static_recurring_tasks_upserts_by_key(pool: PgPool) {
    use ballast_core::RecurringTaskRow;

    let store = PgJobStore::new(pool);
    let task = RecurringTaskRow {
        id: uuid::Uuid::nil(),
        key: "nightly-cleanup".to_string(),
        schedule: "0 0 * * *".to_string(),
        class_name: "maintenance.cleanup".to_string(),
        arguments: json!({}),
        queue_name: "default".to_string(),
        priority: 0,
        static_task: true,
        description: None,
    };
    store
        .reconcile_static_recurring_tasks(std::slice::from_ref(&task))
        .await
        .unwrap();

    let mut updated = task.clone();
    updated.schedule = "0 */6 * * *".to_string();
    store
        .reconcile_static_recurring_tasks(std::slice::from_ref(&updated))
        .await
        .unwrap();

    let all = store.all_recurring_tasks().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].schedule, "0 */6 * * *");
}
