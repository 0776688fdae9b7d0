//! The supervisor (§4.4): spawns a child OS process per configured
//! worker/dispatcher/scheduler, forwards signals, respawns dead children,
//! and prunes peers whose heartbeat has gone stale.
//!
//! Calling `fork()` from a multi-threaded Tokio process is unsound, so "OS
//! fork" here means re-executing the current binary as a child
//! `tokio::process::Command` with [`CHILD_ROLE_ENV`] set to tell it which
//! single runnable to become. The supervisor process itself never runs a
//! runnable.

use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ChildKind, ChildSpec, Configuration};
use crate::error::{QueueError, Result};
use crate::process::{hostname, ProcessHandle};
use crate::store::JobStore;
use crate::types::{NewProcess, ProcessKind};

/// Environment variable the supervisor sets on a child process to tell it
/// which single runnable to become, instead of starting a supervisor of
/// its own. Format: `"<kind>:<index>"`, e.g. `"worker:0"`.
pub const CHILD_ROLE_ENV: &str = "BALLAST_CHILD_ROLE";

/// Environment variable the supervisor sets on a child process carrying its
/// own registered `process_id`, so the child can record the supervisor as
/// its parent (§4.4) instead of registering with `supervisor_id: None`.
pub const SUPERVISOR_PID_ENV: &str = "BALLAST_SUPERVISOR_PID";

impl ChildKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildKind::Worker => "worker",
            ChildKind::Dispatcher => "dispatcher",
            ChildKind::Scheduler => "scheduler",
        }
    }
}

pub struct Supervisor<S: JobStore> {
    store: Arc<S>,
    config: Configuration,
    self_exe: PathBuf,
    extra_args: Vec<String>,
}

struct TrackedChild {
    spec: ChildSpec,
    child: Child,
}

impl<S: JobStore> Supervisor<S> {
    pub fn new(
        store: Arc<S>,
        config: Configuration,
        self_exe: PathBuf,
        extra_args: Vec<String>,
    ) -> Self {
        Self {
            store,
            config,
            self_exe,
            extra_args,
        }
    }

    pub async fn run(&self) -> Result<()> {
        self.config.validate().map_err(QueueError::Configuration)?;

        let _pidfile_guard = self.claim_pidfile()?;

        let poller = crate::poller::PollerHandle::new();
        let process = ProcessHandle::register(
            self.store.clone(),
            NewProcess {
                name: format!("supervisor-{}", std::process::id()),
                kind: ProcessKind::Supervisor,
                pid: std::process::id() as i32,
                hostname: hostname(),
                supervisor_id: None,
                metadata: json!({ "children": self.config.configured_children().len() }),
            },
            self.config.process_heartbeat_interval,
            poller.clone(),
        )
        .await?;

        self.install_signal_handlers(poller.clone());

        let supervisor_id = process.process_id().await;

        let mut children: Vec<TrackedChild> = Vec::new();
        for spec in self.config.configured_children() {
            children.push(self.spawn_child(spec, supervisor_id)?);
        }

        self.supervise(children, poller.clone(), supervisor_id)
            .await;

        process.shutdown().await?;
        self.remove_pidfile();
        Ok(())
    }

    fn spawn_child(&self, spec: ChildSpec, supervisor_id: Option<Uuid>) -> Result<TrackedChild> {
        let role = format!("{}:{}", spec.kind.as_str(), spec.index);
        info!(role = %role, "spawning child process");
        let mut command = Command::new(&self.self_exe);
        command
            .args(&self.extra_args)
            .env(CHILD_ROLE_ENV, &role)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(id) = supervisor_id {
            command.env(SUPERVISOR_PID_ENV, id.to_string());
        }
        let child = command
            .spawn()
            .map_err(|e| QueueError::Configuration(format!("failed to spawn child: {e}")))?;
        Ok(TrackedChild { spec, child })
    }

    async fn supervise(
        &self,
        mut children: Vec<TrackedChild>,
        poller: crate::poller::PollerHandle,
        supervisor_id: Option<Uuid>,
    ) {
        loop {
            if poller.is_stopped() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;

            if poller.is_stopped() {
                break;
            }

            self.prune_dead_peers().await;

            let mut i = 0;
            while i < children.len() {
                match children[i].child.try_wait() {
                    Ok(Some(status)) => {
                        let dead = children.remove(i);
                        warn!(role = %dead.spec.kind.as_str(), index = dead.spec.index, ?status, "child exited");
                        if !poller.is_stopped() {
                            match self.spawn_child(dead.spec, supervisor_id) {
                                Ok(respawned) => children.push(respawned),
                                Err(err) => error!(error = %err, "failed to respawn child"),
                            }
                        }
                    }
                    Ok(None) => i += 1,
                    Err(err) => {
                        error!(error = %err, "failed to poll child status");
                        i += 1;
                    }
                }
            }
        }

        self.shutdown_children(children).await;
    }

    async fn shutdown_children(&self, mut children: Vec<TrackedChild>) {
        for tracked in &children {
            if let Some(pid) = tracked.child.id() {
                // SAFETY: pid is a valid child pid we own; SIGTERM requests
                // a graceful stop the same way the supervisor's own
                // shutdown does for itself.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.supervisor.shutdown_timeout;
        let mut i = 0;
        while i < children.len() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            match children[i].child.try_wait() {
                Ok(Some(_)) => {
                    children.remove(i);
                }
                _ => {
                    i += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        for tracked in &mut children {
            warn!(role = %tracked.spec.kind.as_str(), index = tracked.spec.index, "child exceeded shutdown_timeout, killing");
            let _ = tracked.child.kill().await;
        }
    }

    async fn prune_dead_peers(&self) {
        match self
            .store
            .prune_dead_processes(
                chrono::Duration::from_std(self.config.process_alive_threshold).unwrap(),
                None,
            )
            .await
        {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "pruned dead processes"),
            Err(err) => warn!(error = %err, "failed to prune dead processes"),
        }
    }

    fn install_signal_handlers(&self, poller: crate::poller::PollerHandle) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let term_poller = poller.clone();
            tokio::spawn(async move {
                let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
                let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
                let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
                tokio::select! {
                    _ = term.recv() => { info!("received SIGTERM, shutting down gracefully"); }
                    _ = int.recv() => { info!("received SIGINT, shutting down gracefully"); }
                    _ = quit.recv() => { info!("received SIGQUIT, shutting down immediately"); }
                }
                term_poller.stop();
            });

            let hup_poller = poller.clone();
            tokio::spawn(async move {
                let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
                loop {
                    hup.recv().await;
                    if hup_poller.is_stopped() {
                        break;
                    }
                    info!("received SIGHUP (reload is a no-op in this core)");
                }
            });
        }
    }

    fn claim_pidfile(&self) -> Result<Option<PidfileGuard>> {
        let Some(path) = self.config.supervisor.pidfile.clone() else {
            return Ok(None);
        };

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<i32>() {
                if process_is_alive(pid) {
                    return Err(QueueError::PidfileContention {
                        path: path.display().to_string(),
                        pid,
                    });
                }
            }
        }

        std::fs::write(&path, std::process::id().to_string())
            .map_err(|e| QueueError::Configuration(format!("failed to write pidfile: {e}")))?;
        Ok(Some(PidfileGuard { path }))
    }

    fn remove_pidfile(&self) {
        if let Some(path) = &self.config.supervisor.pidfile {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct PidfileGuard {
    #[allow(dead_code)]
    path: PathBuf,
}

fn process_is_alive(pid: i32) -> bool {
    // signal 0 performs no-op existence/permission checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Parse `CHILD_ROLE_ENV`'s `"<kind>:<index>"` format.
pub fn parse_child_role(raw: &str) -> Option<(ChildKind, usize)> {
    let (kind, index) = raw.split_once(':')?;
    let kind = match kind {
        "worker" => ChildKind::Worker,
        "dispatcher" => ChildKind::Dispatcher,
        "scheduler" => ChildKind::Scheduler,
        _ => return None,
    };
    Some((kind, index.parse().ok()?))
}
