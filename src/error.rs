use crate::telemetry::backends::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("unknown service: {0}")]
    ServiceNotFound(String),

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("daemon is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("service '{service}' failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("service '{service}' exhausted {attempts} recovery attempts")]
    RecoveryExhausted { service: String, attempts: u32 },

    #[error("all service tasks exited while {registered} services remain registered")]
    AllServicesFailed { registered: usize },

    #[error("critical service '{0}' exited")]
    CriticalServiceFailed(String),

    #[error("shutdown timed out waiting for: {}", pending.join(", "))]
    ShutdownTimeout { pending: Vec<String> },

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AgentError {
    pub fn service_failed(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::ServiceFailed {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
