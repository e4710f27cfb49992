pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod log;
pub mod logging;
pub mod telemetry;

pub use config::AgentConfig;
pub use daemon::{DaemonSupervisor, Service, ServiceHealth, ServiceState};
pub use error::{AgentError, Result};
pub use telemetry::{CollectionService, MetricsSnapshot};
