use std::path::PathBuf;

const ENV_CONFIG_DIR: &str = "GPU_AGENT_CONFIG_DIR";
const ENV_LOG: &str = "GPU_AGENT_LOG";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const AGENT_SUBDIR: &str = "gpu-agent";
const CONFIG_FILE: &str = "config.toml";

/// Non-empty value of an environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Agent config directory ($GPU_AGENT_CONFIG_DIR or ~/.config/gpu-agent)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(AGENT_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Config file path (<config_dir>/config.toml)
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

/// Log level override ($GPU_AGENT_LOG)
pub fn log_level_override() -> Option<String> {
    let val = env_opt(ENV_LOG);
    tracing::trace!(value = ?val, "GPU_AGENT_LOG env var");
    val
}
