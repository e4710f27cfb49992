use anyhow::Context;
use gpu_agent::AgentConfig;

use crate::args::ConfigCommands;

pub(crate) fn cmd_config(command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => cmd_config_show(),
        ConfigCommands::Path => {
            println!("{}", AgentConfig::config_path().display());
            Ok(())
        }
    }
}

fn cmd_config_show() -> anyhow::Result<()> {
    let path = AgentConfig::config_path();
    let config = AgentConfig::load()
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if !path.exists() {
        println!("# {} not found, showing defaults", path.display());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
