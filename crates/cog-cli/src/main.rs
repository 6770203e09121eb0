//! cog - CI タスクのディスパッチャ / ワーカー / リカバリツール

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use cog_core::app::{
    AppBuilder, Dispatcher, Recovery, RecoveryError, RecoveryReport, TaskRunner, WorkerCommand,
};
use cog_core::config::{CogConfig, LogFormat, LoggingConfig, StoreConfig};
use cog_core::domain::{LifecycleState, TaskId, epoch_seconds};
use cog_core::impls::{CouchStore, SlurmSubmitter};
use cog_core::ports::SystemClock;
use cog_core::tasks::{BUILTIN_TASKS, register_builtin};

#[derive(Parser, Debug)]
#[command(name = "cog", version, about = "CI task dispatcher and runner")]
struct Cli {
    /// Log filter used when RUST_LOG is not set (overrides the config file).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch for pending tasks and submit them to the cluster until Ctrl-C.
    Dispatch {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run one task (invoked on a cluster node by the submitted job).
    Run {
        /// Task name the job was submitted for.
        task: String,
        doc_id: String,

        #[arg(long)]
        store_url: String,

        #[arg(long)]
        database: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Return tasks in the given state to pending.
    Requeue {
        #[arg(short, long)]
        config: PathBuf,

        /// pending, queued, started or completed.
        state: LifecycleState,

        /// Ignore tasks created before this unix time.
        #[arg(short, long, value_name = "EPOCH_SECS")]
        newer_than: Option<f64>,

        /// Documents per bulk write (defaults to recovery.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Dispatch { config } => {
            let config = load_config(&config)?;
            init_logging(&config.logging, cli.log_level.as_deref())?;
            dispatch(config).await
        }
        Command::Run {
            task,
            doc_id,
            store_url,
            database,
            username,
            password,
        } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref())?;
            let store = StoreConfig::new(store_url, database).with_credentials(username, password);
            run_task(&task, TaskId::new(doc_id), &store).await
        }
        Command::Requeue {
            config,
            state,
            newer_than,
            batch_size,
        } => {
            let config = load_config(&config)?;
            init_logging(&config.logging, cli.log_level.as_deref())?;
            requeue(config, state, newer_than, batch_size).await
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<CogConfig> {
    CogConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

/// Logs go to stderr; stdout is reserved for command output.
fn init_logging(logging: &LoggingConfig, level: Option<&str>) -> Result<()> {
    let level = level.unwrap_or(&logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    }
    .context("failed to initialise logging")
}

async fn dispatch(config: CogConfig) -> Result<()> {
    let store = CouchStore::new(&config.store).context("failed to configure the task store")?;
    let worker = WorkerCommand::new(config.worker.program.clone(), config.store.clone())
        .with_log_dir(config.worker.log_dir.clone());
    let dispatcher = Dispatcher::new(
        Arc::new(store),
        Arc::new(SlurmSubmitter::new(config.submitter.program.clone())),
        Arc::new(SystemClock),
        config.cluster.clone(),
        worker,
    )
    .with_node(config.submitter.node.clone())
    .with_retry_policy(config.store.reconnect.policy());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping dispatcher");
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for Ctrl-C");
                // keep the sender alive; dropping it stops the feed
                std::future::pending::<()>().await
            }
        }
    });

    let stats = dispatcher.run(stop_rx).await;
    info!(submitted = stats.submitted, "dispatcher exited");
    Ok(())
}

async fn run_task(task: &str, id: TaskId, store: &StoreConfig) -> Result<()> {
    let app = register_builtin(AppBuilder::new())
        .context("failed to register task bodies")?
        .expect_tasks(&BUILTIN_TASKS)
        .build()?;
    let store = CouchStore::new(store).context("failed to configure the task store")?;
    let node = hostname::get()
        .context("failed to read the host name")?
        .to_string_lossy()
        .into_owned();

    let runner = TaskRunner::new(Arc::new(store), app.registry, Arc::new(SystemClock), node);
    let report = runner
        .run(&id)
        .await
        .with_context(|| format!("task {id} did not complete"))?;

    if report.name != task {
        warn!(task_id = %id, submitted_as = task, name = %report.name, "document name differs from the submitted task name");
    }
    info!(task_id = %id, success = report.success, attachments = ?report.attachments, "done");
    Ok(())
}

async fn requeue(
    config: CogConfig,
    state: LifecycleState,
    newer_than: Option<f64>,
    batch_size: Option<usize>,
) -> Result<()> {
    let min_created = min_created(newer_than)?;
    let store = CouchStore::new(&config.store).context("failed to configure the task store")?;
    let recovery = Recovery::new(Arc::new(store))
        .with_batch_size(batch_size.unwrap_or(config.recovery.batch_size));

    match recovery.requeue(state, min_created).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(RecoveryError { report, source }) => {
            // committed batches are back to pending whatever happens next
            print_report(&report);
            Err(source).context("recovery stopped early")
        }
    }
}

/// `--newer-than` is an absolute creation time in (fractional) epoch seconds.
fn min_created(newer_than: Option<f64>) -> Result<Option<DateTime<Utc>>> {
    match newer_than {
        Some(secs) => match epoch_seconds::from_seconds(secs) {
            Some(at) => Ok(Some(at)),
            None => bail!("--newer-than {secs} is not a valid unix time"),
        },
        None => Ok(None),
    }
}

fn print_report(report: &RecoveryReport) {
    for id in &report.reset {
        println!("{id}");
    }
    for id in &report.conflicts {
        warn!(task_id = %id, "modified concurrently, not reset");
    }
    for (id, reason) in &report.failed {
        warn!(task_id = %id, %reason, "reset failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_command_line() {
        let cli = Cli::try_parse_from([
            "cog",
            "run",
            "--store-url",
            "http://couch:5984",
            "--database",
            "ci",
            "build",
            "t1",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                task,
                doc_id,
                username,
                ..
            } => {
                assert_eq!(task, "build");
                assert_eq!(doc_id, "t1");
                assert_eq!(username, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_requeue_state() {
        let cli = Cli::try_parse_from([
            "cog", "requeue", "--config", "cog.toml", "started", "--newer-than", "1700000000.5",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Requeue {
                state: LifecycleState::Started,
                newer_than: Some(t),
                ..
            } if t == 1_700_000_000.5
        ));
    }

    #[test]
    fn newer_than_is_an_absolute_unix_time() {
        let cli = Cli::try_parse_from(["cog", "requeue", "-c", "cog.toml", "queued", "-n", "1700000000"])
            .unwrap();
        let Command::Requeue { newer_than, .. } = cli.command else {
            panic!("expected requeue");
        };

        let min = min_created(newer_than).unwrap().unwrap();
        assert_eq!(min, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        assert_eq!(min_created(None).unwrap(), None);
        assert!(min_created(Some(f64::NAN)).is_err());
    }

    #[test]
    fn rejects_unknown_state() {
        assert!(Cli::try_parse_from(["cog", "requeue", "--config", "c.toml", "running"]).is_err());
    }
}
