use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use qlb_core::{period_start, Clock, SystemClock};
use qlb_remote::{FixtureGateway, RemoteApiGateway};
use qlb_storage::{Database, EntityStore, InMemoryStore};
use qlb_sync::{maybe_build_scheduler, Config, GatewaySource, Leaderboard, Shutdown};
use qlb_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "qlb-cli")]
#[command(about = "Quality leaderboard: sync, rank and serve")]
struct Cli {
    /// YAML config file; environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Serve the remote API from a JSON fixture bundle instead of HTTP.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every remote project.
    Sync {
        #[arg(long)]
        full: bool,
    },
    /// Sync one known project.
    SyncProject {
        project_key: String,
        #[arg(long)]
        full: bool,
    },
    /// Compute rankings and champions for a month (default: previous month).
    Rank {
        #[arg(long, value_parser = parse_month)]
        month: Option<NaiveDate>,
    },
    /// Import an issues-search JSON file.
    Import { file: PathBuf },
    Migrate,
    /// Run the JSON API, plus the scheduler when enabled.
    Serve,
    /// Run only the cron scheduler.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::from_env(),
    };
    let command = cli.command.unwrap_or(Commands::Sync { full: false });

    let db = match config.database_url.as_deref() {
        Some(url) => Some(Database::connect(url).await?),
        None => None,
    };
    let store: Arc<dyn EntityStore> = match &db {
        Some(db) => Arc::new(db.store()),
        None => {
            warn!("DATABASE_URL not set, using an in-memory store for this process");
            Arc::new(InMemoryStore::new())
        }
    };

    let (stop_tx, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = match &cli.fixture {
        Some(path) => {
            let gateway: Arc<dyn RemoteApiGateway> = Arc::new(FixtureGateway::from_file(path)?);
            Leaderboard::new(
                store,
                GatewaySource::Fixed(gateway),
                clock,
                config.sync_settings(),
            )
        }
        None => Leaderboard::from_config(store, config.clone(), clock),
    };
    let service = Arc::new(service.with_shutdown(shutdown.clone()));

    match command {
        Commands::Sync { full } => {
            let result = service.trigger_sync(full).await?;
            print_json(&result)?;
        }
        Commands::SyncProject { project_key, full } => {
            let result = service.trigger_project_sync(&project_key, full).await?;
            print_json(&result)?;
        }
        Commands::Rank { month } => {
            let period = month
                .map(period_start)
                .unwrap_or_else(|| qlb_core::previous_period(service.clock().today()));
            let result = service.trigger_ranking_calculation(period).await?;
            print_json(&result)?;
        }
        Commands::Import { file } => {
            let payload = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let result = service.import_issues(&payload).await?;
            print_json(&result)?;
        }
        Commands::Migrate => {
            let db = db.context("DATABASE_URL is required for migrate")?;
            db.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(service.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            qlb_web::serve(AppState::new(service), config.web_port, shutdown.triggered()).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let Some(mut sched) = maybe_build_scheduler(service, &config).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(sync_cron = %config.sync_cron, ranking_cron = %config.ranking_cron, "scheduler running");
            shutdown.triggered().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn parse_month(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .map_err(|_| format!("invalid month {raw}, expected YYYY-MM or YYYY-MM-DD"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_accepts_both_forms() {
        let march = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_month("2024-03").unwrap(), march);
        assert_eq!(parse_month("2024-03-01").unwrap(), march);
        assert!(parse_month("march").is_err());
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["qlb-cli", "--fixture", "f.json", "sync-project", "alpha", "--full"]).unwrap();
        assert_eq!(cli.fixture, Some(PathBuf::from("f.json")));
        assert!(matches!(
            cli.command,
            Some(Commands::SyncProject { ref project_key, full: true }) if project_key == "alpha"
        ));
    }
}
