use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldreg_core::{ConnectivityState, HouseholdRecord, MutationKind, PersonRecord};
use fieldreg_scoring::{load_profile_file, ScoringEngine};
use fieldreg_storage::{ApiClient, ApiConfig, FileStore, KeyValueStore};
use fieldreg_sync::{
    connectivity_channel, spawn_http_probe, DrainOutcome, SyncConfig, SyncQueue, SyncService,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fieldreg")]
#[command(about = "Offline sync queue and vulnerability scoring for field registration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue a mutation for later delivery.
    Enqueue {
        /// create-person, update-person, create-household, submit-survey, upload-document
        kind: MutationKind,
        /// JSON payload file.
        payload: PathBuf,
    },
    /// Pending count and connectivity.
    Status,
    /// Print every queued item.
    Queue,
    /// Drain the queue once.
    Drain,
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Remote score with cache fallback.
    Score {
        person_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Score on-device from person and household JSON files.
    ScoreLocal { person: PathBuf, household: PathBuf },
    BulkScore { person_ids: Vec<String> },
    /// Show the active weighting profile.
    Profile,
    /// Probe connectivity and sync in the background until interrupted.
    Run,
}

#[derive(Debug, Subcommand)]
enum DeadLetterAction {
    Retry,
    Clear,
}

struct Services {
    config: SyncConfig,
    api: ApiClient,
    queue: Arc<SyncQueue>,
    scoring: ScoringEngine,
}

fn build_services() -> Result<Services> {
    let config = SyncConfig::from_env();
    let api = ApiClient::new(ApiConfig::from_env())?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));

    let queue = Arc::new(SyncQueue::new(
        store.clone(),
        Arc::new(api.clone()),
        config.queue_policy(),
    ));

    let mut scoring = ScoringEngine::new(Arc::new(api.clone()), store);
    if let Some(path) = &config.default_profile_path {
        scoring = scoring.with_default_profile(load_profile_file(path)?);
    }

    Ok(Services {
        config,
        api,
        queue,
        scoring,
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fieldreg=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let services = build_services()?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Enqueue { kind, payload } => {
            let payload = read_json(&payload).await?;
            let item = services.queue.enqueue(kind, payload).await?;
            println!("queued {} {}", item.kind, item.id);
        }
        Commands::Status => {
            let connectivity = services.api.probe().await;
            println!(
                "pending={} online={} backend={}",
                services.queue.pending_count().await,
                connectivity.is_online(),
                services.api.base_url()
            );
        }
        Commands::Queue => print_json(&services.queue.get_queue().await)?,
        Commands::Drain => {
            services.queue.recover_in_flight().await?;
            match services.queue.drain().await {
                DrainOutcome::Completed(summary) => println!(
                    "drain complete: synced={} failed={} dead_lettered={} total={}",
                    summary.synced, summary.failed, summary.dead_lettered, summary.total
                ),
                DrainOutcome::AlreadyRunning => eprintln!("a drain is already running"),
            }
        }
        Commands::DeadLetters { action } => match action {
            DeadLetterAction::Retry => {
                let n = services.queue.retry_dead_letters().await?;
                println!("requeued {n} dead-lettered item(s)");
            }
            DeadLetterAction::Clear => {
                let n = services.queue.clear_dead_letters().await?;
                println!("discarded {n} dead-lettered item(s)");
            }
        },
        Commands::Score { person_id, force } => {
            print_json(&services.scoring.calculate_remote(&person_id, force).await?)?
        }
        Commands::ScoreLocal { person, household } => {
            let person: PersonRecord = read_json(&person).await?;
            let household: HouseholdRecord = read_json(&household).await?;
            print_json(&services.scoring.calculate_local(&person, &household).await?)?
        }
        Commands::BulkScore { person_ids } => {
            print_json(&services.scoring.bulk_calculate(&person_ids).await?)?
        }
        Commands::Profile => print_json(&services.scoring.get_weighting_profile().await)?,
        Commands::Run => run(services).await?,
    }

    Ok(())
}

async fn run(services: Services) -> Result<()> {
    let Services {
        config, api, queue, ..
    } = services;

    let recovered = queue.recover_in_flight().await?;
    let (tx, rx) = connectivity_channel(ConnectivityState::offline());
    let probe = spawn_http_probe(api, tx, config.probe_interval());

    let service = SyncService::new(queue, rx, config.sync_interval());
    let listener = service.spawn_connectivity_listener();
    let scheduler = service
        .maybe_build_scheduler(config.scheduler_enabled)
        .await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    info!(
        recovered,
        interval_secs = config.sync_interval_secs,
        scheduler = scheduler.is_some(),
        "sync service running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    listener.abort();
    probe.abort();
    info!(pending = service.queue().pending_count().await, "sync service stopped");
    Ok(())
}
