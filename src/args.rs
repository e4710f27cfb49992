use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gpu-agent")]
#[command(version)]
#[command(about = "Desktop GPU/CPU/memory monitoring agent", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the monitoring daemon in the foreground (Ctrl+C to stop)
    Run {
        /// Seconds between samples (1-300), overrides the config file
        #[arg(short, long)]
        interval: Option<u64>,

        /// Snapshots buffered for the consumer before new ones are dropped
        #[arg(long)]
        queue_capacity: Option<usize>,

        /// Log level or filter directive (e.g. debug, gpu_agent=trace)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Inspect agent configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file location
    Path,
}
