// Metronome CLI
//
// Subcommands: `migrate` applies the schema, `worker` runs a worker against
// one or more queues. Language bindings register task functions in-process;
// the standalone worker binary serves deployments that only run DSL
// workflow programs (registered via --program files).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metronome_core::prelude::*;

#[derive(Parser)]
#[command(name = "metronome")]
#[command(about = "Metronome - durable task and workflow execution on PostgreSQL")]
#[command(version)]
struct Cli {
    /// Database connection string (overrides METRONOME_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply schema migrations
    Migrate,

    /// Run a worker
    Worker {
        /// Queue to subscribe to (repeat for multiple queues)
        #[arg(short, long = "queue", required = true)]
        queues: Vec<String>,

        /// Worker id (generated if omitted)
        #[arg(long)]
        worker_id: Option<String>,

        /// Concurrency ceiling (overrides METRONOME_WORKER_MAX_CONCURRENT)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Workflow program file (JSON form; repeat for multiple programs)
        #[arg(long = "program")]
        programs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metronome=info,metronome_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(url) = &cli.database_url {
        settings = settings.with_database_url(url);
    }

    match run(cli.command, settings).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, settings: Settings) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Migrate => {
            let client = Client::connect(settings, true).await?;
            drop(client);
            println!("Migrations applied");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Worker {
            queues,
            worker_id,
            max_concurrent,
            programs,
        } => run_worker(settings, queues, worker_id, max_concurrent, programs).await,
    }
}

async fn run_worker(
    settings: Settings,
    queues: Vec<String>,
    worker_id: Option<String>,
    max_concurrent: Option<usize>,
    programs: Vec<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let client = Client::connect(settings.clone(), false).await?;

    for path in &programs {
        let source = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read program {}: {e}", path.display()))?;
        let name = client.register_program_source(&source)?;
        tracing::info!(program = %name, path = %path.display(), "registered workflow program");
    }

    let mut config = WorkerConfig::from_settings(&settings, queues);
    if let Some(id) = worker_id {
        config = config.with_worker_id(id);
    }
    if let Some(max) = max_concurrent {
        config = config.with_max_concurrent(max);
    }

    let worker = client.worker_with_config(config);
    worker.start().await?;
    tracing::info!(worker_id = %worker.worker_id(), "worker running, press Ctrl-C to stop");

    wait_for_shutdown_signal().await?;
    tracing::info!("interrupt received, shutting down");
    worker.shutdown().await?;

    // Conventional exit status for SIGINT.
    Ok(ExitCode::from(130))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
