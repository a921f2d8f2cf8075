use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypha::config::AppConfig;
use hypha::queue::{find_open_run, task::execute_run};
use hypha::server::{create_router, AppState};
use hypha::shutdown::{graceful_shutdown, wait_for_shutdown};
use hypha::workflow::{FileStateStore, RunId, StateStore, WorkItemKey};

#[derive(Parser)]
#[command(name = "hypha", about = "Resumable LLM workflow orchestrator for GitHub issues")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct WorkItemArgs {
    /// GitHub App installation id
    #[arg(long)]
    installation: u64,
    /// Repository as owner/name
    #[arg(long)]
    repo: String,
    /// Issue number
    #[arg(long)]
    issue: u64,
}

impl WorkItemArgs {
    fn key(&self) -> WorkItemKey {
        WorkItemKey {
            installation_id: self.installation,
            repo: self.repo.clone(),
            number: self.issue,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the webhook endpoint and drive runs in the background
    Serve,
    /// Drive a run for one issue in the foreground
    Run(WorkItemArgs),
    /// Continue a persisted run in the foreground
    Resume {
        #[arg(long)]
        run_id: String,
        #[command(flatten)]
        item: WorkItemArgs,
    },
    /// Print a persisted run as JSON
    Status {
        #[arg(long)]
        run_id: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_tracing(config.logging.json);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Run(item) => {
            let state = AppState::new(config).await?;
            let key = item.key();
            let run_id = match find_open_run(state.store.as_ref(), &key).await? {
                Some(run_id) => run_id,
                None => RunId::generate(),
            };
            foreground(state, run_id, key).await
        }
        Command::Resume { run_id, item } => {
            let state = AppState::new(config).await?;
            foreground(state, RunId::parse(&run_id)?, item.key()).await
        }
        Command::Status { run_id } => {
            let store = FileStateStore::new(&config.state.dir);
            let run_id = RunId::parse(&run_id)?;
            let record = store
                .load(&run_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&record.state)?);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting Hypha server"
    );

    let state = Arc::new(AppState::new(config.clone()).await?);

    // Resume unfinished runs after a restart
    let scan_state = Arc::clone(&state);
    tokio::spawn(async move {
        hypha::queue::startup::resume_pending_runs(&scan_state).await;
    });

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    graceful_shutdown(&state).await;

    Ok(())
}

async fn foreground(state: AppState, run_id: RunId, key: WorkItemKey) -> anyhow::Result<()> {
    tracing::info!(run_id = %run_id, work_item = %key, "Driving run in the foreground");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        on_signal.cancel();
    });

    let final_state = execute_run(&state, &run_id, &key, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&final_state)?);
    Ok(())
}
