//! The recurring-task scheduler (§4.7): reconciles static tasks on boot,
//! then keeps a cron-driven timetable and enqueues each task exactly once
//! per `(key, run_at)`, racing safely against other scheduler processes via
//! the store's unique-constraint-backed `enqueue_recurring_if_due`.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecurringTaskConfig;
use crate::error::Result;
use crate::poller::{run_loop, PollerHandle};
use crate::process::{hostname, process_name, ProcessHandle};
use crate::store::JobStore;
use crate::types::{NewProcess, ProcessKind, RecurringTaskRow};

/// Upper bound on how long the scheduler will sleep between checks, even if
/// no task's next run is that close; keeps a newly-added recurring task
/// from waiting an arbitrarily long time to be picked up.
const SLEEP_CAP: Duration = Duration::from_secs(60);

pub struct Scheduler<S: JobStore> {
    store: Arc<S>,
    recurring_tasks: Vec<RecurringTaskConfig>,
    poller: PollerHandle,
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(store: Arc<S>, recurring_tasks: Vec<RecurringTaskConfig>) -> Self {
        Self {
            store,
            recurring_tasks,
            poller: PollerHandle::new(),
        }
    }

    pub fn handle(&self) -> PollerHandle {
        self.poller.clone()
    }

    pub async fn run(
        &self,
        heartbeat_interval: Duration,
        supervisor_id: Option<Uuid>,
    ) -> Result<()> {
        let process = ProcessHandle::register(
            self.store.clone(),
            NewProcess {
                name: process_name(ProcessKind::Scheduler, 0),
                kind: ProcessKind::Scheduler,
                pid: std::process::id() as i32,
                hostname: hostname(),
                supervisor_id,
                metadata: json!({
                    "task_keys": self.recurring_tasks.iter().map(|t| &t.key).collect::<Vec<_>>(),
                }),
            },
            heartbeat_interval,
            self.poller.clone(),
        )
        .await?;

        self.reconcile_static_tasks().await;

        run_loop(self.poller.clone(), || self.poll(&process)).await;

        process.shutdown().await
    }

    async fn reconcile_static_tasks(&self) {
        let rows: Vec<RecurringTaskRow> = self
            .recurring_tasks
            .iter()
            .map(|t| RecurringTaskRow {
                id: uuid::Uuid::nil(),
                key: t.key.clone(),
                schedule: t.schedule.clone(),
                class_name: t.class_name.clone(),
                arguments: t.arguments.clone(),
                queue_name: t.queue_name.clone(),
                priority: t.priority,
                static_task: true,
                description: t.description.clone(),
            })
            .collect();

        if rows.is_empty() {
            return;
        }
        info!(count = rows.len(), "reconciling static recurring tasks");
        if let Err(err) = self.store.reconcile_static_recurring_tasks(&rows).await {
            warn!(error = %err, "failed to reconcile static recurring tasks");
        }
    }

    async fn poll(&self, process: &ProcessHandle<S>) -> Duration {
        if !process.is_registered().await {
            self.poller.stop();
            return Duration::ZERO;
        }

        let tasks = match self.store.all_recurring_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "failed to load recurring tasks");
                return SLEEP_CAP;
            }
        };

        let now = Utc::now();
        let mut next_wakeup = now + chrono::Duration::from_std(SLEEP_CAP).unwrap();

        for task in &tasks {
            let schedule = match cron::Schedule::from_str(&task.schedule) {
                Ok(s) => s,
                Err(err) => {
                    warn!(key = %task.key, error = %err, "invalid cron schedule, skipping");
                    continue;
                }
            };

            for run_at in schedule.after(&(now - chrono::Duration::minutes(1))) {
                if run_at > now {
                    if run_at < next_wakeup {
                        next_wakeup = run_at;
                    }
                    break;
                }
                self.fire(task, run_at).await;
            }
        }

        (next_wakeup - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(SLEEP_CAP)
    }

    async fn fire(&self, task: &RecurringTaskRow, run_at: DateTime<Utc>) {
        match self
            .store
            .enqueue_recurring_if_due(
                &task.key,
                run_at,
                &task.class_name,
                task.arguments.clone(),
                &task.queue_name,
                task.priority,
            )
            .await
        {
            Ok(true) => info!(key = %task.key, run_at = %run_at, "enqueued recurring task"),
            Ok(false) => {
                debug!(key = %task.key, run_at = %run_at, "recurring fire already claimed by another scheduler")
            }
            Err(err) => {
                warn!(key = %task.key, run_at = %run_at, error = %err, "failed to enqueue recurring task")
            }
        }
    }
}
