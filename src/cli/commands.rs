//! CLI commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Matview-Store CLI
#[derive(Parser)]
#[command(name = "matview")]
#[command(about = "Deduplicating cache of stream-fed materialized views")]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a store with an in-memory event stream and print what callers see
    Simulate {
        /// Number of service instances registered in the snapshot
        #[arg(short, long, default_value = "3")]
        items: u64,
        /// Number of live updates streamed after the snapshot
        #[arg(short, long, default_value = "5")]
        updates: u64,
        /// Idle TTL for cache entries, in milliseconds
        #[arg(long, default_value = "500")]
        ttl_ms: u64,
        /// Optional JSON config file; overrides --ttl-ms
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a JSON config file
    CheckConfig {
        /// Path to the config file
        path: PathBuf,
    },
}
