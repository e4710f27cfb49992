//! Platform metrics backends.
//!
//! Each backend wraps one data source (NVML, `system_profiler`, CIM, sysinfo)
//! and turns it into [`DeviceReading`]s. A [`BackendSet`] picks exactly one
//! primary backend for the host and falls back to the aggregate system
//! pseudo-device when none is usable.

pub mod cim;
pub mod nvidia;
pub mod system;
pub mod system_profiler;

use super::snapshot::{DeviceReading, MetricsSnapshot};
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use cim::CimBackend;
pub use nvidia::NvmlBackend;
pub use system::SystemBackend;
pub use system_profiler::SystemProfileBackend;

/// Upper bound for any single backend call made from a collection pass.
pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The API could not be initialised on this host
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("{backend} call timed out after {after:?}")]
    Timeout { backend: BackendKind, after: Duration },

    /// Unrecoverable; ends the collection loop
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_))
    }
}

/// Run an external tool and return its stdout, bounded by [`BACKEND_CALL_TIMEOUT`].
///
/// The child is killed if the call is dropped or times out.
pub(crate) async fn run_command(
    kind: BackendKind,
    program: &str,
    args: &[&str],
) -> Result<Vec<u8>, BackendError> {
    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(BACKEND_CALL_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendError::Unavailable(format!("{} not found", program)));
        }
        Ok(Err(e)) => {
            return Err(BackendError::QueryFailed(format!(
                "failed to run {}: {}",
                program, e
            )));
        }
        Err(_) => {
            return Err(BackendError::Timeout {
                backend: kind,
                after: BACKEND_CALL_TIMEOUT,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::QueryFailed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Nvml,
    SystemProfiler,
    Cim,
    System,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Nvml => "nvml",
            BackendKind::SystemProfiler => "system_profiler",
            BackendKind::Cim => "cim",
            BackendKind::System => "system",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hardware telemetry source.
///
/// `open` may be called again after `release`. Field-level failures belong in
/// the returned readings as unavailable metrics; an `Err` from `list_devices`
/// means the whole query failed.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn open(&self) -> Result<(), BackendError>;

    async fn list_devices(&self) -> Result<Vec<DeviceReading>, BackendError>;

    async fn release(&self) -> Result<(), BackendError>;

    /// Whether the backend is currently open and usable
    fn availability(&self) -> bool;
}

/// Backends for one host: ordered primary candidates plus the aggregate fallback.
pub struct BackendSet {
    primaries: Vec<Box<dyn MetricsBackend>>,
    fallback: Box<dyn MetricsBackend>,
    selected: Option<usize>,
    probed: bool,
    call_timeout: Duration,
    logger: SharedLogger,
}

impl BackendSet {
    pub fn new(
        primaries: Vec<Box<dyn MetricsBackend>>,
        fallback: Box<dyn MetricsBackend>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            primaries,
            fallback,
            selected: None,
            probed: false,
            call_timeout: BACKEND_CALL_TIMEOUT,
            logger,
        }
    }

    /// Candidates appropriate for the current platform.
    pub fn detect(logger: SharedLogger) -> Self {
        #[allow(unused_mut)]
        let mut primaries: Vec<Box<dyn MetricsBackend>> =
            vec![Box::new(NvmlBackend::new(logger.clone()))];

        #[cfg(target_os = "macos")]
        primaries.push(Box::new(SystemProfileBackend::new(logger.clone())));

        #[cfg(target_os = "windows")]
        primaries.push(Box::new(CimBackend::new(logger.clone())));

        let fallback = Box::new(SystemBackend::new(logger.clone()));
        Self::new(primaries, fallback, logger)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        kind: BackendKind,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                backend: kind,
                after: self.call_timeout,
            }),
        }
    }

    /// Open candidates in order and keep the first that works.
    ///
    /// Probing happens once per open/release cycle.
    pub async fn select(&mut self) -> Option<BackendKind> {
        if self.probed {
            return self.primary();
        }
        self.probed = true;

        for (idx, backend) in self.primaries.iter().enumerate() {
            let kind = backend.kind();
            match self.bounded(kind, backend.open()).await {
                Ok(()) => {
                    log_info!(self.logger, "Using {} backend", kind);
                    self.selected = Some(idx);
                    return Some(kind);
                }
                Err(e) => log_debug!(self.logger, "Backend {} not usable: {}", kind, e),
            }
        }

        log_info!(
            self.logger,
            "No GPU backend available, reporting system aggregate instead"
        );
        None
    }

    pub fn primary(&self) -> Option<BackendKind> {
        self.selected.map(|idx| self.primaries[idx].kind())
    }

    /// Query the selected backend, or the fallback, and build a snapshot.
    ///
    /// A primary that turns `Unavailable` is released and this pass falls
    /// back; selection is redone on the next pass. Other primary errors are
    /// returned as-is for the caller to classify. The fallback path always
    /// yields exactly one pseudo-device.
    pub async fn collect(&mut self, sequence: u64) -> Result<MetricsSnapshot, BackendError> {
        self.select().await;

        if let Some(idx) = self.selected {
            let backend = &self.primaries[idx];
            let kind = backend.kind();
            let listed = self.bounded(kind, backend.list_devices()).await;
            match listed {
                Ok(devices) if !devices.is_empty() => {
                    return Ok(MetricsSnapshot::new(sequence, kind, devices));
                }
                Ok(_) => log_debug!(self.logger, "{} reported no devices, using fallback", kind),
                Err(BackendError::Unavailable(reason)) => {
                    log_warn!(
                        self.logger,
                        "{} backend became unavailable ({}), using fallback",
                        kind,
                        reason
                    );
                    self.drop_primary(idx).await;
                }
                Err(e) => return Err(e),
            }
        }

        let device = self.fallback_reading().await;
        Ok(MetricsSnapshot::new(
            sequence,
            BackendKind::System,
            vec![device],
        ))
    }

    async fn drop_primary(&mut self, idx: usize) {
        let backend = &self.primaries[idx];
        let kind = backend.kind();
        if let Err(e) = self.bounded(kind, backend.release()).await {
            log_debug!(self.logger, "Failed to release {} backend: {}", kind, e);
        }
        self.selected = None;
        self.probed = false;
    }

    async fn fallback_reading(&self) -> DeviceReading {
        let kind = self.fallback.kind();
        if !self.fallback.availability() {
            if let Err(e) = self.bounded(kind, self.fallback.open()).await {
                log_warn!(self.logger, "Fallback backend unavailable: {}", e);
                return system::unavailable_reading(&e);
            }
        }

        match self.bounded(kind, self.fallback.list_devices()).await {
            Ok(mut devices) if !devices.is_empty() => devices.swap_remove(0),
            Ok(_) => system::unavailable_reading(&BackendError::QueryFailed(
                "no aggregate reading".into(),
            )),
            Err(e) => {
                log_warn!(self.logger, "Fallback query failed: {}", e);
                system::unavailable_reading(&e)
            }
        }
    }

    /// Release every open backend, best effort. Selection starts over afterwards.
    pub async fn release_all(&mut self) {
        let open = self
            .primaries
            .iter()
            .chain(std::iter::once(&self.fallback))
            .filter(|b| b.availability());
        for backend in open {
            let kind = backend.kind();
            match self.bounded(kind, backend.release()).await {
                Ok(()) => log_debug!(self.logger, "Released {} backend", kind),
                Err(e) => log_warn!(self.logger, "Failed to release {} backend: {}", kind, e),
            }
        }
        self.selected = None;
        self.probed = false;
    }

    /// Availability flag per backend, primaries first.
    pub fn availability(&self) -> Vec<(BackendKind, bool)> {
        self.primaries
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|b| (b.kind(), b.availability()))
            .collect()
    }
}
