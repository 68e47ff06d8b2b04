use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fleetsync", version, about = "Fleet telematics sync engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every ingestion service until interrupted (default if no subcommand given).
    Run {
        /// Database URL override (else `FLEETSYNC_DATABASE_URL`).
        #[arg(long)]
        database_url: Option<String>,

        /// Serve the upstream feeds from an in-process fleet simulator.
        #[arg(long, env = "FLEETSYNC_SIMULATE", default_value_t = false)]
        simulate: bool,

        /// Number of simulated devices.
        #[arg(long, default_value = "5")]
        fleet_size: usize,

        /// Seconds between simulated telemetry bursts.
        #[arg(long, default_value = "2")]
        tick_seconds: u64,
    },

    /// Check configuration, database connectivity and the tracking records of every service.
    Validate {
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Print the effective configuration (database URL redacted).
    Config,
}
