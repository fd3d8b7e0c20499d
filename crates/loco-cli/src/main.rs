use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use loco_storage::PgRecordStore;
use loco_sync::{SummaryAssembler, SyncConfig};
use loco_web::WebConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loco-cli")]
#[command(about = "Loco data summary cache and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Re-fetch every sheet and replace the cached collections.
    Refresh,
    /// Print per-collection counts from the store.
    ///
    /// Refresh timestamps live in the serving process, so this command always
    /// reports `pending` with no `last_refresh`; query `/api/status` on a running
    /// server for those.
    Status,
    /// List loco numbers containing PARTIAL.
    Search { partial: String },
    /// Print the joined summary for one locomotive.
    Show { loco_no: String },
    /// Create the Postgres schema and tables.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let coordinator = loco_sync::coordinator_from_config(&config).await?;
            let scheduler = loco_sync::maybe_build_scheduler(&config, coordinator.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await?;
                tracing::info!(cron = config.refresh_cron.as_str(), "refresh scheduler started");
            }
            loco_web::serve(WebConfig::from_env(), coordinator).await?;
        }
        Commands::Refresh => {
            let coordinator = loco_sync::coordinator_from_config(&config).await?;
            let counts = coordinator.refresh_all().await?;
            println!(
                "refresh complete: loco_data={} schedule_data={} failure_data={} modifications_data={}",
                counts.loco_data, counts.schedule_data, counts.failure_data, counts.modifications_data
            );
        }
        Commands::Status => {
            let coordinator = loco_sync::coordinator_from_config(&config).await?;
            println!("{}", serde_json::to_string_pretty(&coordinator.status().await?)?);
        }
        Commands::Search { partial } => {
            let assembler = SummaryAssembler::new(loco_sync::coordinator_from_config(&config).await?);
            for loco_no in assembler.search(&partial).await? {
                println!("{loco_no}");
            }
        }
        Commands::Show { loco_no } => {
            let assembler = SummaryAssembler::new(loco_sync::coordinator_from_config(&config).await?);
            let summary = assembler.get_summary(&loco_no).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let Some(database_url) = &config.database_url else {
                bail!("DATABASE_URL must be set to migrate");
            };
            let store = PgRecordStore::connect(database_url, &config.db_name).await?;
            store.migrate().await?;
            println!("schema {} ready", store.schema());
        }
    }

    Ok(())
}
