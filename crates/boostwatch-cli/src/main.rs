use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use boostwatch_core::week;
use boostwatch_storage::Store;
use boostwatch_sync::{WatchConfig, ALLIANCE_METRIC, CLUB_METRIC};

#[derive(Debug, Parser)]
#[command(name = "boostwatch")]
#[command(about = "Club boost page watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the watcher loops until interrupted.
    Run,
    /// Print one stored week of a metric's ledger.
    Report {
        /// Metric key, "club" or "alliance".
        #[arg(long, default_value = "club")]
        metric: String,
        /// Week to report, as the Monday date (YYYY-MM-DD). Defaults to the
        /// current week.
        #[arg(long)]
        week: Option<NaiveDate>,
    },
    /// List every week with stored ledger data.
    Weeks {
        #[arg(long, default_value = "club")]
        metric: String,
    },
}

fn metric_key(name: &str) -> Result<&'static str> {
    match name {
        "club" => Ok(CLUB_METRIC),
        "alliance" => Ok(ALLIANCE_METRIC),
        other => anyhow::bail!("unknown metric {other:?}, expected \"club\" or \"alliance\""),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    let _ = shutdown_tx.send(true);
                }
            });
            boostwatch_sync::run_from_env(shutdown_rx).await?;
        }
        Commands::Report { metric, week } => {
            let metric = metric_key(&metric)?;
            let config = WatchConfig::from_env();
            let store = Store::open(&config.database_path).await?;
            let week_start =
                week::week_start_of_date(week.unwrap_or_else(week::current_week_start));
            println!(
                "{}",
                boostwatch_sync::report_week_text(&store, metric, week_start).await?
            );
        }
        Commands::Weeks { metric } => {
            let metric = metric_key(&metric)?;
            let config = WatchConfig::from_env();
            let store = Store::open(&config.database_path).await?;
            println!("{}", boostwatch_sync::list_weeks_text(&store, metric).await?);
        }
    }

    Ok(())
}
