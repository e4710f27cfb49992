//! Injected logging.
//!
//! Library components never reach for the global `tracing` dispatcher
//! themselves. They take an `Arc<dyn Logger>` at construction and log through
//! the `log_*!` macros, so the binary decides where messages go and tests can
//! capture or silence them.
//!
//! ```
//! use gpu_agent::log::{Logger, NoOpLogger};
//! use gpu_agent::log_info;
//! use std::sync::Arc;
//!
//! let logger: Arc<dyn Logger> = Arc::new(NoOpLogger);
//! log_info!(logger, "collector ready (interval: {}s)", 5);
//! ```

#[cfg(test)]
mod capture;
mod noop;
mod tracing_adapter;
mod r#trait;

#[cfg(test)]
pub use capture::CapturingLogger;
pub use noop::NoOpLogger;
pub use r#trait::{LogLevel, Logger};
pub use tracing_adapter::TracingLogger;

use std::sync::Arc;

/// Shorthand for the logger handed to every component.
pub type SharedLogger = Arc<dyn Logger>;

/// Logger that forwards to `tracing`, for the binary.
pub fn tracing_logger() -> SharedLogger {
    Arc::new(TracingLogger::new())
}

/// Logger that drops everything.
pub fn noop_logger() -> SharedLogger {
    Arc::new(NoOpLogger)
}
