//! # ImageBatch CLI
//!
//! Operator entry point: apply migrations, submit CSV batches, query progress and run
//! workers.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use imagebatch_core::config::{detect_environment, Backend, ImageBatchConfig};
use imagebatch_core::logging::{flush_logs, init_structured_logging};
use imagebatch_core::messaging::Lane;
use imagebatch_core::orchestration::OrchestrationSystem;

#[derive(Parser)]
#[command(name = "imagebatch")]
#[command(about = "Batch orchestration for product image processing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory
    #[arg(short, long, default_value = "config", env = "IMAGEBATCH_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Environment overlay to load (defaults to IMAGEBATCH_ENV, then APP_ENV)
    #[arg(short, long)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations and exit
    Migrate,

    /// Submit a CSV batch
    Submit {
        /// CSV file with serial, product name and image URL columns
        csv: PathBuf,

        /// Reference recorded as the batch's input artifact (defaults to the file path)
        #[arg(long)]
        input_ref: Option<String>,

        /// Run workers in this process and wait for the batch to finish
        #[arg(long)]
        wait: bool,
    },

    /// Show a batch's progress
    Status {
        batch_id: Uuid,
    },

    /// Consume unit tasks until interrupted
    Worker {
        /// Lanes to poll, comma separated (defaults to the configured lanes)
        #[arg(long, value_delimiter = ',')]
        lanes: Vec<Lane>,
    },

    /// Load and validate configuration, then print it
    ValidateConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let environment = cli.environment.clone().unwrap_or_else(detect_environment);
    let config = ImageBatchConfig::load_from_directory(&cli.config_dir, &environment)
        .with_context(|| {
            format!(
                "loading configuration from {} ({environment})",
                cli.config_dir.display()
            )
        })?;

    let result = match cli.command {
        Commands::ValidateConfig => {
            println!("✅ Configuration valid for environment '{environment}'");
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Migrate => migrate(config).await,
        Commands::Submit {
            csv,
            input_ref,
            wait,
        } => submit(config, csv, input_ref, wait).await,
        Commands::Status { batch_id } => status(config, batch_id).await,
        Commands::Worker { lanes } => worker(config, lanes).await,
    };

    flush_logs();
    result
}

async fn migrate(mut config: ImageBatchConfig) -> anyhow::Result<()> {
    if config.database.backend != Backend::Postgres {
        bail!("migrations only apply to the postgres backend");
    }
    config.database.run_migrations = true;
    let system = OrchestrationSystem::bootstrap(config).await?;
    println!("✅ Migrations applied and lane queues created");
    system.shutdown().await;
    Ok(())
}

async fn submit(
    config: ImageBatchConfig,
    csv: PathBuf,
    input_ref: Option<String>,
    wait: bool,
) -> anyhow::Result<()> {
    let system = OrchestrationSystem::bootstrap(config).await?;
    let workers = wait.then(|| system.start_workers(&[]));

    let file = File::open(&csv).with_context(|| format!("opening {}", csv.display()))?;
    let input_ref = input_ref.or_else(|| Some(csv.display().to_string()));
    let report = system.submit_csv(file, input_ref).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(workers) = workers {
        loop {
            let progress = system.get_status(report.batch_uuid).await?;
            if progress.status.is_terminal() {
                println!("{}", serde_json::to_string_pretty(&progress)?);
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        workers.shutdown().await;
    }

    system.shutdown().await;
    Ok(())
}

async fn status(config: ImageBatchConfig, batch_id: Uuid) -> anyhow::Result<()> {
    let system = OrchestrationSystem::bootstrap(config).await?;
    let progress = system.get_status(batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&progress)?);
    system.shutdown().await;
    Ok(())
}

async fn worker(config: ImageBatchConfig, lanes: Vec<Lane>) -> anyhow::Result<()> {
    let reconcile = config.reconciliation.enabled;
    let system = OrchestrationSystem::bootstrap(config).await?;

    let workers = system.start_workers(&lanes);
    let reconciler = reconcile.then(|| system.start_reconciler());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("🛑 Shutdown signal received");

    workers.shutdown().await;
    if let Some(reconciler) = reconciler {
        reconciler.shutdown().await;
    }
    system.shutdown().await;
    Ok(())
}
