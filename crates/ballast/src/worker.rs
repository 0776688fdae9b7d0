//! The worker runnable (§4.3): claims ready executions across its
//! configured queues and runs them on a bounded task pool.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{FailureKind, Result};
use crate::poller::{run_loop, PollerHandle};
use crate::pool::TaskPool;
use crate::process::{hostname, process_name, ProcessHandle};
use crate::queues::resolve;
use crate::registry::{Callable, CommandRegistry, DeserializationError};
use crate::store::JobStore;
use crate::types::{NewProcess, ProcessKind};

const IDLE_BACKOFF: Duration = Duration::from_secs(10 * 60);

pub struct Worker<S: JobStore> {
    store: Arc<S>,
    registry: CommandRegistry,
    config: WorkerConfig,
    preserve_finished_jobs: bool,
    index: usize,
    poller: PollerHandle,
    pool: TaskPool,
}

impl<S: JobStore> Worker<S> {
    pub fn new(
        store: Arc<S>,
        registry: CommandRegistry,
        config: WorkerConfig,
        preserve_finished_jobs: bool,
        index: usize,
    ) -> Self {
        let poller = PollerHandle::new();
        let wake = poller.clone();
        let pool = TaskPool::new(config.threads, move || wake.wake_up());
        Self {
            store,
            registry,
            config,
            preserve_finished_jobs,
            index,
            poller,
            pool,
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
                name: process_name(ProcessKind::Worker, self.index),
                kind: ProcessKind::Worker,
                pid: std::process::id() as i32,
                hostname: hostname(),
                supervisor_id,
                metadata: json!({
                    "queues": self.config.queues,
                    "threads": self.config.threads,
                    "polling_interval_ms": self.config.polling_interval.as_millis(),
                }),
            },
            heartbeat_interval,
            self.poller.clone(),
        )
        .await?;

        run_loop(self.poller.clone(), || self.poll(&process)).await;

        process.shutdown().await
    }

    async fn poll(&self, process: &ProcessHandle<S>) -> Duration {
        if !process.is_registered().await {
            self.poller.stop();
            return Duration::ZERO;
        }

        let limit = self.pool.available_slots();
        if limit == 0 {
            return self.config.polling_interval;
        }

        let known = match self.store.known_queue_names().await {
            Ok(q) => q,
            Err(err) => {
                warn!(error = %err, "failed to list known queues");
                return self.config.polling_interval;
            }
        };
        let paused = match self.store.paused_queue_names().await {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to list paused queues");
                return self.config.polling_interval;
            }
        };
        let queues = resolve(&self.config.queues, &known, &paused);

        let process_id = process.process_id().await;
        let claimed = match self
            .store
            .claim_ready(process_id, &queues, limit as i64)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "claim_ready failed");
                return self.config.polling_interval;
            }
        };

        if !claimed.is_empty() {
            info!(count = claimed.len(), "claimed ready executions");
        }

        for job in claimed {
            // Resolve before spawning: an unresolvable class_name must not
            // consume a pool slot, since nothing will ever free it.
            match self.registry.resolve(&job.class_name) {
                Some(callable) => {
                    let store = self.store.clone();
                    let preserve = self.preserve_finished_jobs;
                    self.pool.spawn(async move {
                        execute_one(store, callable, job, preserve).await;
                    });
                }
                None => {
                    warn!(job_id = %job.job_id, class_name = %job.class_name, "unknown job class");
                    let err = DeserializationError {
                        class_name: job.class_name.clone(),
                        message: "no callable registered for this class_name".to_string(),
                    };
                    fail(
                        &self.store,
                        job.claimed_execution_id,
                        job.job_id,
                        job.concurrency_key.as_deref(),
                        &err.to_string(),
                        FailureKind::NonRetryable,
                    )
                    .await;
                }
            }
        }

        if self.pool.is_idle() {
            self.config.polling_interval
        } else {
            IDLE_BACKOFF
        }
    }
}

async fn execute_one<S: JobStore>(
    store: Arc<S>,
    callable: Arc<dyn Callable>,
    job: crate::types::ClaimedJob,
    preserve_finished_jobs: bool,
) {
    match callable.call(job.arguments.clone()).await {
        Ok(()) => {
            finish(
                &store,
                job.claimed_execution_id,
                job.job_id,
                preserve_finished_jobs,
            )
            .await
        }
        Err(err) => {
            error!(job_id = %job.job_id, error = %err, "job callable failed");
            fail(
                &store,
                job.claimed_execution_id,
                job.job_id,
                job.concurrency_key.as_deref(),
                &format!("{err:#}"),
                FailureKind::Retryable,
            )
            .await;
        }
    }
}

async fn finish<S: JobStore>(
    store: &Arc<S>,
    claimed_execution_id: Uuid,
    job_id: Uuid,
    preserve_finished_jobs: bool,
) {
    if let Err(err) = store
        .mark_finished(claimed_execution_id, job_id, preserve_finished_jobs)
        .await
    {
        error!(job_id = %job_id, error = %err, "failed to mark job finished");
    }
}

async fn fail<S: JobStore>(
    store: &Arc<S>,
    claimed_execution_id: Uuid,
    job_id: Uuid,
    concurrency_key: Option<&str>,
    error_text: &str,
    kind: FailureKind,
) {
    if let Err(err) = store
        .mark_failed(
            claimed_execution_id,
            job_id,
            concurrency_key,
            error_text,
            kind,
        )
        .await
    {
        error!(job_id = %job_id, error = %err, "failed to record job failure");
    }
}
