//! Typed configuration, re-expressed from the source's `Configuration`
//! dataclasses. Loadable from TOML by the binary crate via `config`/`toml`;
//! embedders can also build it by hand.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_alive_threshold() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_clear_finished_jobs_after() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_concurrency_control_period() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_worker_polling_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dispatcher_polling_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_dispatcher_batch_size() -> i64 {
    // The source disagrees with itself across revisions (100 vs 500); 500
    // wins here for throughput (§9 open question).
    500
}

fn default_concurrency_maintenance_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_threads() -> usize {
    3
}

fn default_processes() -> usize {
    1
}

fn default_priority() -> i32 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default = "default_worker_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,
}

fn default_queues() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            threads: default_threads(),
            processes: default_processes(),
            polling_interval: default_worker_polling_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(
        default = "default_dispatcher_polling_interval",
        with = "humantime_serde"
    )]
    pub polling_interval: Duration,
    #[serde(default = "default_dispatcher_batch_size")]
    pub batch_size: i64,
    /// Gates the periodic side task that expires leaked concurrency
    /// permits, fails orphaned claims, and sweeps finished jobs — one
    /// dispatcher's worth of fleet housekeeping, not just concurrency.
    #[serde(default = "default_true")]
    pub concurrency_maintenance: bool,
    #[serde(
        default = "default_concurrency_maintenance_interval",
        with = "humantime_serde"
    )]
    pub concurrency_maintenance_interval: Duration,
}

fn default_true() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_dispatcher_polling_interval(),
            batch_size: default_dispatcher_batch_size(),
            concurrency_maintenance: true,
            concurrency_maintenance_interval: default_concurrency_maintenance_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTaskConfig {
    pub key: String,
    pub class_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub schedule: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_queue_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub pidfile: Option<std::path::PathBuf>,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pidfile: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// The full process-fleet configuration: what the supervisor spawns, plus
/// the global knobs every runnable reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub dispatchers: Vec<DispatcherConfig>,
    #[serde(default)]
    pub recurring_tasks: Vec<RecurringTaskConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub process_heartbeat_interval: Duration,
    #[serde(default = "default_alive_threshold", with = "humantime_serde")]
    pub process_alive_threshold: Duration,
    #[serde(default = "default_true")]
    pub preserve_finished_jobs: bool,
    #[serde(
        default = "default_clear_finished_jobs_after",
        with = "humantime_serde"
    )]
    pub clear_finished_jobs_after: Duration,
    #[serde(
        default = "default_concurrency_control_period",
        with = "humantime_serde"
    )]
    pub default_concurrency_control_period: Duration,

    /// `--only-work`: skip dispatcher and scheduler processes, run workers
    /// only.
    #[serde(default)]
    pub only_work: bool,
    #[serde(default)]
    pub skip_recurring: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            workers: vec![WorkerConfig::default()],
            dispatchers: vec![DispatcherConfig::default()],
            recurring_tasks: Vec::new(),
            supervisor: SupervisorConfig::default(),
            process_heartbeat_interval: default_heartbeat_interval(),
            process_alive_threshold: default_alive_threshold(),
            preserve_finished_jobs: true,
            clear_finished_jobs_after: default_clear_finished_jobs_after(),
            default_concurrency_control_period: default_concurrency_control_period(),
            only_work: false,
            skip_recurring: false,
        }
    }
}

/// One spawnable child spec, the unit the supervisor works from. Mirrors
/// `Configuration.Process` / `.instantiate()` from the source, minus the
/// dynamic dispatch on a string kind (the supervisor matches on
/// [`ChildKind`] directly).
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub kind: ChildKind,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Worker,
    Dispatcher,
    Scheduler,
}

impl Configuration {
    /// Fail fast on structurally invalid configuration (§7
    /// `ConfigurationError`).
    pub fn validate(&self) -> Result<(), String> {
        if self.configured_children().is_empty() {
            return Err("configuration declares no workers, dispatchers, or scheduler".into());
        }
        for worker in &self.workers {
            if worker.threads == 0 {
                return Err("worker thread pool size must be at least 1".into());
            }
            if worker.queues.is_empty() {
                return Err("worker must declare at least one queue pattern".into());
            }
        }
        for recurring in &self.recurring_tasks {
            use std::str::FromStr;
            cron::Schedule::from_str(&recurring.schedule)
                .map_err(|e| format!("invalid cron schedule for `{}`: {e}", recurring.key))?;
        }
        Ok(())
    }

    /// The flattened list of child processes the supervisor should keep
    /// alive, replicated per `processes` count for workers.
    pub fn configured_children(&self) -> Vec<ChildSpec> {
        let mut children = Vec::new();
        for (worker_index, worker) in self.workers.iter().enumerate() {
            for replica in 0..worker.processes {
                children.push(ChildSpec {
                    kind: ChildKind::Worker,
                    index: worker_index * 1000 + replica,
                });
            }
        }

        if self.only_work {
            return children;
        }

        for (i, _) in self.dispatchers.iter().enumerate() {
            children.push(ChildSpec {
                kind: ChildKind::Dispatcher,
                index: i,
            });
        }

        if !self.skip_recurring {
            children.push(ChildSpec {
                kind: ChildKind::Scheduler,
                index: 0,
            });
        }

        children
    }
}
