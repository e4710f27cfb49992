use super::{LogLevel, Logger};
use std::fmt::Arguments;

/// Forwards records to whatever `tracing` subscriber the binary installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, args: Arguments<'_>) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "gpu_agent", "{}", args),
            LogLevel::Debug => tracing::debug!(target: "gpu_agent", "{}", args),
            LogLevel::Info => tracing::info!(target: "gpu_agent", "{}", args),
            LogLevel::Warn => tracing::warn!(target: "gpu_agent", "{}", args),
            LogLevel::Error => tracing::error!(target: "gpu_agent", "{}", args),
        }
    }
}
