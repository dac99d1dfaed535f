//! `docent`: documentation question answering.
//!
//! ```text
//! docent update                 # refresh the index from [documents].root
//! docent worker                 # answer queued questions until interrupted
//! docent ask "how do I ..."     # answer one question on stdout
//! docent enqueue "how do I ..." # add a question to the SQLite queue
//! docent health --max-age 120   # fail when the worker heartbeat is stale
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use docent_core::AppBuilder;
use docent_core::bootstrap::resolve_config_path;
use docent_index::{RefreshOutcome, RefreshReport};
use docent_worker::AnyJobSource;
use docent_worker::heartbeat::{check_heartbeat, read_heartbeat};

#[derive(Parser)]
#[command(name = "docent", version, about = "Question answering over a documentation tree")]
struct Cli {
    /// Config file (defaults to $DOCENT_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-index changed documents and drop deleted ones
    Update {
        /// Document root, overriding [documents].root
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Claim and answer pending questions until interrupted
    Worker,
    /// Answer a single question and print it
    Ask { question: String },
    /// Add a question to the SQLite job queue
    Enqueue { question: String },
    /// Exit with failure when the worker heartbeat is older than --max-age seconds
    Health {
        #[arg(long, default_value_t = 60)]
        max_age: u64,
        /// Heartbeat file, overriding [worker].heartbeat_path
        #[arg(long)]
        heartbeat: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_subscriber();

    let app = AppBuilder::load(resolve_config_path(cli.config.as_deref())).await?;
    tracing::debug!(config = %app.config_path().display(), "configuration loaded");

    match cli.command {
        Command::Update { root } => update(&app, root).await?,
        Command::Worker => worker(&app).await?,
        Command::Ask { question } => ask(&app, &question).await?,
        Command::Enqueue { question } => enqueue(&app, &question).await?,
        Command::Health { max_age, heartbeat } => return health(&app, max_age, heartbeat).await,
    }
    Ok(ExitCode::SUCCESS)
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn update(app: &AppBuilder, root: Option<PathBuf>) -> anyhow::Result<()> {
    let root = root.unwrap_or_else(|| app.config().documents.root.clone());
    let store = app.open_store().await?;
    let embedder = Arc::new(app.build_embedding_provider()?);
    docent_core::bootstrap::health_check(&embedder).await;
    let updater = app.build_updater(store, embedder)?;

    match updater
        .refresh(&root)
        .await
        .with_context(|| format!("refresh of {} failed", root.display()))?
    {
        RefreshOutcome::Completed(report) => print_report(&report),
        RefreshOutcome::AlreadyRunning => println!("a refresh is already running"),
    }
    Ok(())
}

fn print_report(report: &RefreshReport) {
    println!(
        "scanned {} documents: {} updated, {} unchanged, {} removed, {} failed, {} repaired",
        report.documents_scanned,
        report.documents_updated,
        report.documents_unchanged,
        report.documents_removed,
        report.documents_failed,
        report.documents_repaired
    );
    if report.documents_retained > 0 {
        println!(
            "{} documents kept because their directories could not be read",
            report.documents_retained
        );
    }
    println!(
        "chunks: {} embedded, {} reused, {} skipped ({} ms)",
        report.chunks_embedded, report.chunks_reused, report.chunks_skipped, report.duration_ms
    );
    for error in &report.errors {
        println!("  {error}");
    }
}

async fn worker(app: &AppBuilder) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = AppBuilder::build_shutdown();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let mut worker = app.build_worker(shutdown_rx).await?;
    worker.run().await;
    Ok(())
}

async fn ask(app: &AppBuilder, question: &str) -> anyhow::Result<()> {
    let answerer = app.build_answerer().await?;
    match answerer.answer(question).await {
        Ok(answer) => println!("{}", answer.text),
        Err(e) => {
            tracing::error!("question failed: {e}");
            println!("{}", answerer.failure_message(&e));
        }
    }
    Ok(())
}

async fn enqueue(app: &AppBuilder, question: &str) -> anyhow::Result<()> {
    let AnyJobSource::Sqlite(source) = app.build_job_source().await? else {
        bail!("enqueue is only available for the sqlite job source");
    };
    let id = source.enqueue(question).await?;
    println!("{id}");
    Ok(())
}

async fn health(
    app: &AppBuilder,
    max_age: u64,
    heartbeat: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let Some(path) = heartbeat.or_else(|| app.config().worker.heartbeat_path.clone()) else {
        bail!("no heartbeat file configured: set [worker].heartbeat_path or pass --heartbeat");
    };
    let max_age = Duration::from_secs(max_age);
    match check_heartbeat(&path, max_age).await {
        Ok(true) => {
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Ok(false) => {
            let last = read_heartbeat(&path).await?;
            println!("stale: last activity at {last}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            println!("unhealthy: cannot read {}: {e}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}
