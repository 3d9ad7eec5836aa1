//! Matview-Store: Main entry point

use anyhow::Context;
use clap::Parser;
use matview_store::cli::{simulate, Cli, Commands};
use matview_store::config::StoreConfig;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Simulate {
            items,
            updates,
            ttl_ms,
            config,
        } => {
            let config = match config {
                Some(path) => StoreConfig::from_json_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => StoreConfig::default().with_idle_ttl(Duration::from_millis(ttl_ms)),
            };
            let report = simulate(config, items, updates)
                .await
                .context("simulation failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::CheckConfig { path } => {
            let config = StoreConfig::from_json_file(&path)
                .with_context(|| format!("invalid config {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
