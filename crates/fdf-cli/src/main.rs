use anyhow::Result;
use clap::{Parser, Subcommand};
use fdf_core::DestinationRecord;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fdf-cli")]
#[command(about = "Flight Deal Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one search pass over every origin and destination.
    Sync,
    /// Run search passes on FDF_SYNC_CRON until Ctrl-C; needs FDF_SCHEDULER_ENABLED=true.
    Schedule,
    /// Print the persisted destination ledger.
    Ledger,
    /// Validate configuration without querying anything.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn priced(records: &[DestinationRecord]) -> usize {
    records.iter().filter(|r| r.best_price().is_priced()).count()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = fdf_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} destinations={} queries={} improvements={} reports={}",
                summary.run_id,
                summary.destinations,
                summary.stats.queries,
                summary.stats.improvements,
                summary.report_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Schedule => fdf_sync::run_scheduled_from_env().await?,
        Commands::Ledger => {
            let records = fdf_sync::load_ledger_from_env().await?;
            if records.is_empty() {
                println!("ledger is empty; run `fdf-cli sync` to seed it");
            } else {
                println!("{}", fdf_sync::render_ledger_markdown(&records));
                println!("\n{} of {} destinations priced", priced(&records), records.len());
            }
        }
        Commands::CheckConfig => {
            let config = fdf_sync::SyncConfig::from_env()?;
            config.validate()?;
            info!(
                origins = ?config.origins,
                trip_days = ?config.trip_duration,
                offset_days = ?config.search_offset,
                max_iterations = config.max_iterations,
                fixtures = config.fixtures_dir.is_some(),
                serpapi_key = config.serpapi_key.is_some(),
                whatsapp = config.twilio.is_some(),
                "configuration ok"
            );
            println!("configuration ok");
        }
    }

    Ok(())
}
