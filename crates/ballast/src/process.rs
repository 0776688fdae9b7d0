//! Process registration and heartbeats (§4.5), shared by every runnable.
//! Grounded in the source's `Registrable` mixin: register on boot, launch a
//! heartbeat timer, deregister on shutdown; a heartbeat against a pruned
//! row clears the local reference and wakes the poller so it notices
//! `is_registered() == false` and shuts down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::poller::PollerHandle;
use crate::store::JobStore;
use crate::types::{NewProcess, ProcessKind};

/// Registers a runnable with the database and keeps its heartbeat alive
/// until `shutdown` is called.
pub struct ProcessHandle<S: JobStore> {
    store: Arc<S>,
    process_id: RwLock<Option<Uuid>>,
    heartbeat_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl<S: JobStore> ProcessHandle<S> {
    pub async fn register(
        store: Arc<S>,
        new_process: NewProcess,
        heartbeat_interval: Duration,
        poller: PollerHandle,
    ) -> Result<Arc<Self>> {
        let process = store.register_process(new_process).await?;
        debug!(process_id = %process.id, kind = process.kind.as_str(), "registered process");

        let handle = Arc::new(Self {
            store: store.clone(),
            process_id: RwLock::new(Some(process.id)),
            heartbeat_task: RwLock::new(None),
        });

        let heartbeat_handle = handle.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                if poller.is_stopped() {
                    break;
                }
                heartbeat_handle.heartbeat(&poller).await;
            }
        });
        *handle.heartbeat_task.write().await = Some(task);

        Ok(handle)
    }

    pub async fn process_id(&self) -> Option<Uuid> {
        *self.process_id.read().await
    }

    pub async fn is_registered(&self) -> bool {
        self.process_id().await.is_some()
    }

    async fn heartbeat(&self, poller: &PollerHandle) {
        let Some(id) = *self.process_id.read().await else {
            return;
        };
        match self.store.heartbeat_process(id).await {
            Ok(true) => debug!(process_id = %id, "heartbeat"),
            Ok(false) => {
                warn!(process_id = %id, "process row missing at heartbeat, treating as pruned");
                *self.process_id.write().await = None;
                poller.wake_up();
            }
            Err(err) => warn!(process_id = %id, error = %err, "heartbeat failed"),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.heartbeat_task.write().await.take() {
            task.abort();
        }
        let id = self.process_id.write().await.take();
        if let Some(id) = id {
            self.store.deregister_process(id).await?;
            debug!(process_id = %id, "deregistered process");
        }
        Ok(())
    }
}

pub fn hostname() -> String {
    hostname_inner().unwrap_or_else(|| "unknown-host".to_string())
}

fn hostname_inner() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            let output = std::process::Command::new("hostname").output().ok()?;
            String::from_utf8(output.stdout)
                .ok()
                .map(|s| s.trim().to_string())
        })
}

pub fn process_name(kind: ProcessKind, index: usize) -> String {
    format!("{}-{}-{}", kind.as_str(), std::process::id(), index)
}
