//! Reference supervisor binary for the ballast job queue.
//!
//! Each runnable (worker, dispatcher, scheduler) runs as its own OS
//! process, spawned by the supervisor re-executing this same binary with
//! `BALLAST_CHILD_ROLE` set (see `ballast_core::supervisor`). An embedder
//! that needs its own job callables links `ballast-core`/`ballast-postgres`
//! directly and builds a thin binary of its own around
//! `Supervisor`/`Worker`/`Dispatcher`/`Scheduler`; this one is deliberately
//! generic and registers only a demo callable, skipped with
//! `--disable-autoload`.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ballast_core::{
    parse_child_role, ChildKind, CommandRegistry, Configuration, Dispatcher, PollerHandle,
    QueueError, Scheduler, Supervisor, Worker, CHILD_ROLE_ENV, SUPERVISOR_PID_ENV,
};
use ballast_postgres::PgJobStore;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

struct Args {
    config_path: Option<PathBuf>,
    only_work: bool,
    disable_autoload: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = env::args().skip(1);
    let sub = args.next().ok_or_else(|| {
        anyhow::anyhow!("usage: ballastd start [--only-work] [--config PATH] [--disable-autoload]")
    })?;
    if sub != "start" {
        anyhow::bail!("unknown subcommand `{sub}`; only `start` is supported");
    }

    let mut config_path = None;
    let mut only_work = false;
    let mut disable_autoload = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--only-work" => only_work = true,
            "--disable-autoload" => disable_autoload = true,
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path argument"))?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unrecognized argument `{other}`"),
        }
    }
    Ok(Args {
        config_path,
        only_work,
        disable_autoload,
    })
}

fn load_config(path: Option<PathBuf>, only_work: bool) -> anyhow::Result<Configuration> {
    let mut configuration = match &path {
        Some(path) => {
            let raw = config::Config::builder()
                .add_source(config::File::from(path.as_path()))
                .build()?;
            raw.try_deserialize()?
        }
        None => Configuration::default(),
    };
    configuration.only_work = configuration.only_work || only_work;
    configuration
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    Ok(configuration)
}

async fn build_store() -> anyhow::Result<Arc<PgJobStore>> {
    let database_url =
        env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect(&database_url)
        .await?;
    let store = PgJobStore::new(pool);
    store.migrate().await?;
    Ok(Arc::new(store))
}

fn demo_registry() -> CommandRegistry {
    let registry = CommandRegistry::new();
    registry.register(
        "ballast.demo.echo",
        Arc::new(|arguments: serde_json::Value| async move {
            tracing::info!(?arguments, "ballast.demo.echo invoked");
            Ok(())
        }),
    );
    registry
}

/// Forward `SIGTERM`/`SIGINT` to the runnable's poller, the same graceful
/// stop the supervisor installs for itself.
fn install_shutdown_signals(poller: PollerHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            poller.stop();
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    if let Ok(role) = env::var(CHILD_ROLE_ENV) {
        return run_child(&role).await;
    }

    match run_supervisor().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let is_pidfile_contention = err
                .downcast_ref::<QueueError>()
                .map(|e| matches!(e, QueueError::PidfileContention { .. }))
                .unwrap_or(false);
            tracing::error!(error = %err, "ballastd exited with an error");
            ExitCode::from(if is_pidfile_contention { 2 } else { 1 })
        }
    }
}

async fn run_supervisor() -> anyhow::Result<()> {
    let args = parse_args()?;
    let configuration = load_config(args.config_path.clone(), args.only_work)?;
    let store = build_store().await?;
    let self_exe = env::current_exe()?;
    let extra_args: Vec<String> = env::args().skip(1).collect();

    let supervisor = Supervisor::new(store, configuration, self_exe, extra_args);
    supervisor.run().await?;
    Ok(())
}

async fn run_child(role: &str) -> ExitCode {
    let Some((kind, index)) = parse_child_role(role) else {
        tracing::error!(role, "invalid {CHILD_ROLE_ENV} value");
        return ExitCode::FAILURE;
    };

    let args = match parse_args() {
        Ok(a) => a,
        Err(err) => {
            tracing::error!(error = %err, "invalid arguments");
            return ExitCode::FAILURE;
        }
    };
    let configuration = match load_config(args.config_path.clone(), args.only_work) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };
    let store = match build_store().await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to database");
            return ExitCode::from(1);
        }
    };

    let supervisor_id = env::var(SUPERVISOR_PID_ENV)
        .ok()
        .and_then(|raw| Uuid::parse_str(&raw).ok());

    let heartbeat_interval = configuration.process_heartbeat_interval;
    let result = match kind {
        ChildKind::Worker => {
            let worker_index = index / 1000;
            let Some(worker_config) = configuration.workers.get(worker_index).cloned() else {
                tracing::error!(worker_index, "no worker configuration for this index");
                return ExitCode::FAILURE;
            };
            let registry = if args.disable_autoload {
                CommandRegistry::new()
            } else {
                demo_registry()
            };
            let worker = Worker::new(
                store,
                registry,
                worker_config,
                configuration.preserve_finished_jobs,
                index,
            );
            install_shutdown_signals(worker.handle());
            worker.run(heartbeat_interval, supervisor_id).await
        }
        ChildKind::Dispatcher => {
            let Some(dispatcher_config) = configuration.dispatchers.get(index).cloned() else {
                tracing::error!(index, "no dispatcher configuration for this index");
                return ExitCode::FAILURE;
            };
            let dispatcher = Dispatcher::new(
                store,
                dispatcher_config,
                index,
                configuration.preserve_finished_jobs,
                configuration.clear_finished_jobs_after,
            );
            install_shutdown_signals(dispatcher.handle());
            dispatcher.run(heartbeat_interval, supervisor_id).await
        }
        ChildKind::Scheduler => {
            let scheduler = Scheduler::new(store, configuration.recurring_tasks.clone());
            install_shutdown_signals(scheduler.handle());
            scheduler.run(heartbeat_interval, supervisor_id).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "runnable exited with an error");
            ExitCode::FAILURE
        }
    }
}
