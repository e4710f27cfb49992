mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            interval,
            queue_capacity,
            log_level,
        } => {
            let overrides = commands::run::RunOverrides {
                interval,
                queue_capacity,
                log_level,
            };
            commands::run::cmd_run(overrides).await?
        }
        Commands::Config { command } => commands::config::cmd_config(command)?,
    }

    Ok(())
}
