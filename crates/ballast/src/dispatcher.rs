//! The dispatcher runnable: promotes due `ScheduledExecution`s to
//! `ReadyExecution`/`BlockedExecution` in batches, and runs the periodic
//! maintenance side task (concurrency-permit expiry, orphaned-claim
//! failure, and finished-job retention sweep).

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::poller::{run_loop, PollerHandle};
use crate::process::{hostname, process_name, ProcessHandle};
use crate::store::JobStore;
use crate::types::{NewProcess, ProcessKind};

pub struct Dispatcher<S: JobStore> {
    store: Arc<S>,
    config: DispatcherConfig,
    index: usize,
    poller: PollerHandle,
    preserve_finished_jobs: bool,
    clear_finished_jobs_after: chrono::Duration,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        config: DispatcherConfig,
        index: usize,
        preserve_finished_jobs: bool,
        clear_finished_jobs_after: Duration,
    ) -> Self {
        Self {
            store,
            config,
            index,
            poller: PollerHandle::new(),
            preserve_finished_jobs,
            clear_finished_jobs_after: chrono::Duration::from_std(clear_finished_jobs_after)
                .unwrap_or(chrono::Duration::zero()),
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
                name: process_name(ProcessKind::Dispatcher, self.index),
                kind: ProcessKind::Dispatcher,
                pid: std::process::id() as i32,
                hostname: hostname(),
                supervisor_id,
                metadata: json!({ "batch_size": self.config.batch_size }),
            },
            heartbeat_interval,
            self.poller.clone(),
        )
        .await?;

        if self.config.concurrency_maintenance {
            self.spawn_maintenance();
        }

        run_loop(self.poller.clone(), || self.poll(&process)).await;

        process.shutdown().await
    }

    async fn poll(&self, process: &ProcessHandle<S>) -> Duration {
        if !process.is_registered().await {
            self.poller.stop();
            return Duration::ZERO;
        }

        match self.store.dispatch_next_batch(self.config.batch_size).await {
            Ok(0) => self.config.polling_interval,
            Ok(dispatched) => {
                debug!(dispatched, "dispatched scheduled executions");
                // Drain the backlog immediately rather than waiting out a
                // full tick, matching the source's batch-size-sized re-poll.
                Duration::ZERO
            }
            Err(err) => {
                warn!(error = %err, "dispatch_next_batch failed");
                self.config.polling_interval
            }
        }
    }

    fn spawn_maintenance(&self) {
        let store = self.store.clone();
        let interval = self.config.concurrency_maintenance_interval;
        let poller = self.poller.clone();
        let batch_size = self.config.batch_size;
        let preserve_finished_jobs = self.preserve_finished_jobs;
        let clear_finished_jobs_after = self.clear_finished_jobs_after;
        tokio::spawn(async move {
            loop {
                poller.interruptible_sleep(interval).await;
                if poller.is_stopped() {
                    break;
                }
                match store.expire_blocked_executions().await {
                    Ok(0) => {}
                    Ok(n) => debug!(promoted = n, "expired blocked executions promoted"),
                    Err(err) => warn!(error = %err, "concurrency maintenance failed"),
                }
                match store.fail_orphaned_claims().await {
                    Ok(0) => {}
                    Ok(n) => debug!(failed = n, "orphaned claims failed"),
                    Err(err) => warn!(error = %err, "orphaned-claim sweep failed"),
                }
                if preserve_finished_jobs {
                    let older_than = chrono::Utc::now() - clear_finished_jobs_after;
                    match store.sweep_finished_jobs(older_than, batch_size).await {
                        Ok(0) => {}
                        Ok(n) => debug!(deleted = n, "swept finished jobs"),
                        Err(err) => warn!(error = %err, "finished-job sweep failed"),
                    }
                }
            }
        });
    }
}
