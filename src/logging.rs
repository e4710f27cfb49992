//! Subscriber setup for the `gpu-agent` binary.
//!
//! Installs one `tracing` registry with a reloadable `EnvFilter` so the log
//! verbosity can be changed while the daemon runs. A valid `RUST_LOG` wins
//! over the configured level, at startup and on every config reload.

use crate::error::{AgentError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for changing the active log level after startup.
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
    /// Filter came from `RUST_LOG`
    env_pinned: bool,
}

impl LogLevelHandle {
    /// Replace the active filter with `level` (e.g. "debug", "gpu_agent=trace").
    pub fn set_level(&self, level: &str) -> Result<()> {
        let filter = parse_filter(level)?;
        self.inner
            .reload(filter)
            .map_err(|e| AgentError::Logging(e.to_string()))
    }

    /// Apply a level read from the config file.
    ///
    /// Returns `Ok(false)` without touching the filter when `RUST_LOG` chose it.
    pub fn apply_configured_level(&self, level: &str) -> Result<bool> {
        if self.env_pinned {
            return Ok(false);
        }
        self.set_level(level)?;
        Ok(true)
    }

    pub fn is_env_pinned(&self) -> bool {
        self.env_pinned
    }
}

/// Parse a level or directive string into a filter.
pub fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| AgentError::Config(format!("invalid log level '{}': {}", level, e)))
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_logging(level: &str) -> Result<LogLevelHandle> {
    let (filter, env_pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (parse_filter(level)?, false),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AgentError::Logging(e.to_string()))?;

    Ok(LogLevelHandle {
        inner: handle,
        env_pinned,
    })
}
