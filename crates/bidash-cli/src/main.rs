use std::path::PathBuf;

use anyhow::{Context, Result};
use bidash_storage::{load_seed_file, RowStore};
use bidash_sync::{open_store, run_once_from_env, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bidash-cli")]
#[command(about = "BI dashboard query orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the row store and apply migrations.
    Migrate,
    /// Load row definitions from the seed file into the row store.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print every row with its cached value.
    Rows,
    /// Execute all rows once.
    Run {
        /// Execute without writing results.
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the web server (and the scheduler when enabled).
    Serve,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Migrate => {
            let store = RowStore::open(&config.db_path)
                .await
                .with_context(|| format!("opening row store {}", config.db_path.display()))?;
            println!("migrations applied: {}", store.path().display());
        }
        Commands::Seed { file } => {
            let path = file.unwrap_or_else(|| config.seed_file.clone());
            let defs = load_seed_file(&path)
                .await
                .with_context(|| format!("loading seed file {}", path.display()))?;
            let store = RowStore::open(&config.db_path).await?;
            let report = store.seed_definitions(&defs).await?;
            println!(
                "seed complete: file={} inserted={} updated={}",
                path.display(),
                report.inserted,
                report.updated
            );
        }
        Commands::Rows => {
            let store = open_store(&config).await?;
            for row in store.list_rows().await? {
                let status = match (row.error_type, &row.value) {
                    (Some(kind), _) => format!("[{kind}]"),
                    (None, Some(value)) => value.clone(),
                    (None, None) => "-".to_string(),
                };
                println!(
                    "{:>4}  {:<4} {:<20} {:<28} {}",
                    row.id, row.server_name, row.chart_group, row.variable_name, status
                );
            }
        }
        Commands::Run { dry_run } => {
            let summary = run_once_from_env(!dry_run).await?;
            info!(run_id = %summary.run_id, "run complete");
            println!(
                "run complete: run_id={} outcome={:?} total={} succeeded={} failed={} production={}",
                summary.run_id,
                summary.outcome,
                summary.total,
                summary.succeeded,
                summary.failed,
                summary.is_production
            );
        }
        Commands::Serve => {
            bidash_web::serve_from_env().await?;
        }
    }

    Ok(())
}
