//! Settlement batch driver.
//!
//! Runs the settlement engine over every due window, printing the batch
//! report as JSON. A non-empty failure list exits with code 2 so cron/CI
//! wrappers notice windows left pending for retry.
//!
//! Usage:
//!   streetcall-settle run
//!   streetcall-settle watch --interval 60
//!   streetcall-settle verify --user 42

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use streetcall_core::{
    FixedWindowSchedule, GameConfig, GameStore, HttpPriceSource, Ledger, SettlementEngine,
};

#[derive(Parser, Debug)]
#[command(name = "streetcall-settle")]
#[command(about = "Settle due forecast windows and audit the points ledger")]
struct Args {
    /// Path to the SQLite database (overrides STREETCALL_DB).
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Settle everything due right now and print the report.
    Run,

    /// Settle in a loop, once per interval.
    Watch {
        /// Seconds between runs.
        #[arg(long, default_value = "60")]
        interval: u64,
    },

    /// Verify a user's ledger chain and print the balance.
    Verify {
        #[arg(long)]
        user: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("streetcall_core=info".parse().unwrap())
                .add_directive("settle=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let mut config = GameConfig::from_env();
    if let Some(db) = args.db {
        config.database_path = db;
    }

    let store = Arc::new(
        GameStore::open(&config.database_path)
            .with_context(|| format!("open game store at {}", config.database_path))?,
    );
    let ledger = Ledger::new(store.clone());
    let session = Arc::new(FixedWindowSchedule::default());
    let price = Arc::new(HttpPriceSource::new(&config.price_base_url));
    let engine = SettlementEngine::new(store, ledger.clone(), session, price, config);

    match args.command {
        Commands::Run => {
            let report = engine.settle_due(Utc::now()).await.context("settlement run")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failures.is_empty() {
                std::process::exit(2);
            }
        }
        Commands::Watch { interval } => loop {
            match engine.settle_due(Utc::now()).await {
                Ok(report) => {
                    info!(
                        windows = report.windows.len(),
                        failures = report.failures.len(),
                        "settlement pass"
                    );
                    println!("{}", serde_json::to_string(&report)?);
                }
                Err(e) => {
                    tracing::error!(error = %e, "settlement pass failed");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        },
        Commands::Verify { user } => {
            ledger
                .verify_user_chain(user)
                .await
                .with_context(|| format!("ledger chain verification for user {user}"))?;
            let balance = ledger.balance(user).await?;
            println!("ledger chain ok for user {user}, balance {balance}");
        }
    }

    Ok(())
}
