//! zoektd: the Zoekt index orchestrator daemon.
//!
//! Assembles the state store, the event consumer and the scheduling cron
//! into one process.
//!
//! # Usage
//!
//! ```text
//! zoektd run --config /etc/zoekt/zoekt.toml
//! zoektd schedule lost_nodes_check --without-cache
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zoekt_core::{StaticGates, ZoektConfig};
use zoekt_events::{ChannelBus, RecordingBus, WorkerContext};
use zoekt_scheduler::{EventConsumer, ScheduledTask, SchedulingService, SchedulingWorker, route};
use zoekt_state::StateStore;

#[derive(Parser)]
#[command(name = "zoektd", about = "Zoekt index orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the consumer and the scheduling cron until Ctrl-C.
    Run {
        #[arg(long, default_value = "zoekt.toml")]
        config: PathBuf,

        /// Overrides `[daemon] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run one scheduled task and process the events it publishes.
    Schedule {
        task: String,

        /// Ignore the task's execute-every throttle.
        #[arg(long)]
        without_cache: bool,

        #[arg(long, default_value = "zoekt.toml")]
        config: PathBuf,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the default configuration.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,zoektd=debug,zoekt=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let config = load_config(&config, data_dir)?;
            run(config).await
        }
        Command::Schedule {
            task,
            without_cache,
            config,
            data_dir,
        } => {
            let task: ScheduledTask = task.parse()?;
            let config = load_config(&config, data_dir)?;
            schedule_once(config, task, without_cache).await
        }
        Command::DefaultConfig => {
            print!("{}", ZoektConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: &Path, data_dir: Option<PathBuf>) -> anyhow::Result<ZoektConfig> {
    let mut config = ZoektConfig::load_or_default(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(dir) = data_dir {
        config.daemon.data_dir = dir;
    }
    Ok(config)
}

fn open_store(config: &ZoektConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.daemon.data_dir)?;
    let db_path = config.daemon.data_dir.join("zoekt.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(config: ZoektConfig) -> anyhow::Result<()> {
    info!("zoekt orchestrator starting");
    let store = open_store(&config)?;

    let (bus, events) = ChannelBus::new();
    let ctx = WorkerContext::new(
        store,
        config.limits.clone(),
        Arc::new(StaticGates::new(config.gates.clone())),
        Arc::new(bus),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = EventConsumer::new(ctx.clone(), config.daemon.worker_concurrency);
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_handle = tokio::spawn(async move {
        consumer.run(events, consumer_shutdown).await;
    });

    let cron = SchedulingWorker::new(ctx);
    let interval = Duration::from_secs(config.daemon.schedule_interval_secs.max(1));
    let mut cron_shutdown = shutdown_rx;
    let cron_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cron.perform().await;
                }
                _ = cron_shutdown.changed() => break,
            }
        }
        info!("scheduling cron stopped");
    });
    info!(interval_secs = interval.as_secs(), "scheduling cron started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = cron_handle.await;
    let _ = consumer_handle.await;
    info!("zoekt orchestrator stopped");
    Ok(())
}

async fn schedule_once(
    config: ZoektConfig,
    task: ScheduledTask,
    without_cache: bool,
) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let bus = Arc::new(RecordingBus::new());
    let ctx = WorkerContext::new(
        store,
        config.limits.clone(),
        Arc::new(StaticGates::new(config.gates.clone())),
        bus.clone(),
    );

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let service = SchedulingService::new(ctx.clone());
        let did_work = if without_cache {
            service.execute_without_cache(task)?
        } else {
            service.execute(task)?
        };
        info!(task = task.name(), did_work, "scheduled task executed");

        let mut handled = 0;
        loop {
            let events = bus.take();
            if events.is_empty() {
                break;
            }
            for event in &events {
                if let Err(e) = route(&ctx, event) {
                    error!(event = event.name(), error = %e, "event handler failed");
                }
                handled += 1;
            }
        }
        info!(handled, "events processed");
        Ok(())
    })
    .await?
}
