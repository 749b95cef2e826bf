//! Ingestion and validation core for an OpenStreetMap change-monitoring
//! service: discover replication state, fetch and parse osmChange
//! documents, resolve way geometry, upsert into a spatial store, and
//! aggregate per-user stats and conflation flags.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod catalog;
pub mod conflate;
pub mod context;
pub mod error;
pub mod fetch;
pub mod model;
pub mod nodecache;
pub mod osmchange;
pub mod planet;
pub mod state;
pub mod stats;
pub mod store;
pub mod validate;

#[derive(Parser, Debug)]
#[command(about, version)]
pub struct Args {
    /// Enable verbose output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Postgres connection string for the spatial store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// GeoJSON file restricting which modified nodes trigger a synthetic
    /// way re-derivation.
    #[arg(long, value_name = "file")]
    pub boundary: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll the replication server forever: discover the next state file,
    /// fetch it, apply it to the store, repeat.
    Monitor {
        /// Replication server hostname.
        #[arg(long, default_value = "planet.openstreetmap.org")]
        host: String,
        /// Replication server port.
        #[arg(long, default_value = "443")]
        port: u16,
        /// Replication cadence to poll.
        #[arg(long, default_value = "minute")]
        frequency: String,
        /// Number of parallel fetch workers per chunk.
        #[arg(long, default_value = "8")]
        workers: usize,
    },
    /// Walk the replication server's full directory tree for one cadence
    /// and catalog every state file not already recorded, chunked across
    /// a worker pool (spec §4.D). Does not fetch or apply the matching
    /// change files; it only catches the `states` table up.
    Backfill {
        /// Replication server hostname.
        #[arg(long, default_value = "planet.openstreetmap.org")]
        host: String,
        /// Replication server port.
        #[arg(long, default_value = "443")]
        port: u16,
        /// Replication cadence to scan.
        #[arg(long, default_value = "minute")]
        frequency: String,
        /// Number of parallel fetch workers per chunk.
        #[arg(long, default_value = "8")]
        workers: usize,
    },
    /// Apply one already-downloaded osmChange file to the store, without
    /// touching the replication catalog. Useful for offline testing and
    /// backfilling a single file.
    Replay {
        /// Path to a `.osc` or `.osc.gz` file.
        input_file: PathBuf,
    },
}
