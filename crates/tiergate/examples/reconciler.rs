//! Example: run the Reconciler against a toncenter-style endpoint with a SQLite store,
//! printing each CycleReport as JSON.
//!
//! Configuration comes from the environment (see `ReconcilerConfig::from_env`).
//!
//! Usage:
//!   SUBSCRIPTION_CONTRACT=EQ... cargo run -p tiergate --example reconciler -- [--link ADDR]...
//!   cargo run -p tiergate --example reconciler -- --status ADDR
//!   cargo run -p tiergate --example reconciler -- --upgrade ADDR TIER DAYS

use anyhow::{Context, Result};
use std::sync::Arc;
use tiergate::{
    Clock, EntitlementStore, HttpLedgerClient, ReconcilerBuilder, ReconcilerConfig, SqliteStore,
    SystemClock, Tier,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

enum Command {
    Run { link: Vec<String> },
    Status(String),
    Upgrade { address: String, tier: Tier, days: u64 },
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut link = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--link" => {
                i += 1;
                link.push(args.get(i).cloned().context("--link needs an address")?);
            }
            "--status" => {
                let addr = args.get(i + 1).cloned().context("--status needs an address")?;
                return Ok(Command::Status(addr));
            }
            "--upgrade" => {
                let address = args.get(i + 1).cloned().context("--upgrade needs an address")?;
                let tier: Tier = args.get(i + 2).context("--upgrade needs a tier")?.parse()?;
                let days = args
                    .get(i + 3)
                    .context("--upgrade needs a day count")?
                    .parse::<u64>()
                    .context("days must be an integer")?;
                return Ok(Command::Upgrade {
                    address,
                    tier,
                    days,
                });
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
        i += 1;
    }
    Ok(Command::Run { link })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tiergate=info".parse()?))
        .init();

    let command = parse_args()?;
    let now = SystemClock.now();

    let link = match command {
        Command::Status(address) => {
            let store = SqliteStore::open(&ReconcilerConfig::db_path_from_env())?;
            match store.get(&address).await? {
                Some(row) => {
                    println!("{}", serde_json::to_string(&row)?);
                    println!("effective tier: {}", row.effective_tier(now));
                    match row.daily_query_limit(now) {
                        Some(n) => println!("daily queries: {n}"),
                        None => println!("daily queries: unlimited"),
                    }
                }
                None => println!("{address}: not linked"),
            }
            return Ok(());
        }
        Command::Upgrade {
            address,
            tier,
            days,
        } => {
            let store = SqliteStore::open(&ReconcilerConfig::db_path_from_env())?;
            let row = store
                .manual_upgrade(&address, tier, now + days * 24 * 3600, now)
                .await?;
            println!("{}", serde_json::to_string(&row)?);
            return Ok(());
        }
        Command::Run { link } => link,
    };

    let config = ReconcilerConfig::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    for address in &link {
        let row = store.link_wallet(address, now).await?;
        tracing::info!(address = %row.address, tier = %row.tier, "wallet linked");
    }

    let client = HttpLedgerClient::new(
        &config.api_url,
        config.api_key.clone(),
        config.query_timeout,
    )?;
    let mut reconciler = ReconcilerBuilder::new(client, Arc::clone(&store))
        .contract_address(config.contract_address.clone())
        .interval(config.poll_interval)
        .concurrency(config.concurrency)
        .build()?;

    let mut reports = reconciler.subscribe();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(reason = %e, "serialize report"),
            }
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("ctrl-c received, stopping after current cycle");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                // Keep the sender alive; dropping it would stop the loop.
                tracing::warn!(reason = %e, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
                drop(stop_tx);
            }
        }
    });

    reconciler.run(stop_rx).await;
    Ok(())
}
