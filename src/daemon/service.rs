//! Service lifecycle contract shared by every supervised service.

use super::recovery::RecoveryPolicy;
use crate::error::Result;
use crate::log::{Logger, SharedLogger};
use crate::telemetry::queue::SnapshotSender;
use crate::{log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for a single dependency health check.
pub const DEPENDENCY_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Constructed, never started
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Failed; eligible for recovery until the retry budget is spent
    Error,
    Recovering,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// `Stop` is a no-op from these states
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Init => "initialized",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
            ServiceState::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health observation. A new value is produced on every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Service-specific observations (backend flags, timestamps, counters)
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub recovery_attempts: u32,
    pub last_recovery_time: Option<DateTime<Utc>>,
}

impl ServiceHealth {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            last_check: Utc::now(),
            error_count: 0,
            last_error: Some(reason.into()),
            metrics: BTreeMap::new(),
            recovery_attempts: 0,
            last_recovery_time: None,
        }
    }
}

#[derive(Debug)]
struct CoreState {
    state: ServiceState,
    error_count: u32,
    last_error: Option<String>,
    recovery_attempts: u32,
    last_recovery_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
}

/// State and bookkeeping common to every service.
///
/// Concrete services embed one `ServiceCore` and expose it through
/// [`Service::core`]; the supervisor and the recovery routine only ever talk
/// to services through the trait plus this core.
pub struct ServiceCore {
    name: String,
    logger: SharedLogger,
    inner: Mutex<CoreState>,
    critical: AtomicBool,
    recovery: RecoveryPolicy,
    dependencies: Mutex<Vec<Arc<dyn Service>>>,
}

impl ServiceCore {
    pub fn new(name: impl Into<String>, logger: SharedLogger) -> Self {
        Self {
            name: name.into(),
            logger,
            inner: Mutex::new(CoreState {
                state: ServiceState::Init,
                error_count: 0,
                last_error: None,
                recovery_attempts: 0,
                last_recovery_time: None,
                started_at: None,
            }),
            critical: AtomicBool::new(false),
            recovery: RecoveryPolicy::default(),
            dependencies: Mutex::new(Vec::new()),
        }
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    pub fn set_recovery_policy(&mut self, policy: RecoveryPolicy) {
        self.recovery = policy;
    }

    pub fn with_critical(self, critical: bool) -> Self {
        self.set_critical(critical);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    pub fn recovery_policy(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state
    }

    pub fn set_state(&self, state: ServiceState) {
        let previous = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.state, state)
        };
        if previous != state {
            log_debug!(self.logger, "Service '{}': {} -> {}", self.name, previous, state);
        }
    }

    /// Atomically move to `next` if the current state is one of `from`.
    pub fn transition(&self, from: &[ServiceState], next: ServiceState) -> bool {
        let previous = {
            let mut inner = self.lock();
            if !from.contains(&inner.state) {
                return false;
            }
            std::mem::replace(&mut inner.state, next)
        };
        log_debug!(self.logger, "Service '{}': {} -> {}", self.name, previous, next);
        true
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed)
    }

    pub fn set_critical(&self, critical: bool) {
        self.critical.store(critical, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: impl ToString) {
        let mut inner = self.lock();
        inner.error_count = inner.error_count.saturating_add(1);
        inner.last_error = Some(error.to_string());
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.lock().last_error = error;
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn error_count(&self) -> u32 {
        self.lock().error_count
    }

    pub fn mark_started(&self) {
        self.lock().started_at = Some(Instant::now());
    }

    pub fn clear_started(&self) {
        self.lock().started_at = None;
    }

    /// Time since the service last entered `Running`
    pub fn uptime(&self) -> Option<Duration> {
        self.lock().started_at.map(|t| t.elapsed())
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.lock().recovery_attempts
    }

    pub fn last_recovery_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_recovery_time
    }

    /// Count a recovery attempt and return the new attempt number.
    pub(crate) fn begin_recovery(&self) -> u32 {
        let mut inner = self.lock();
        inner.recovery_attempts += 1;
        inner.last_recovery_time = Some(Utc::now());
        inner.recovery_attempts
    }

    pub(crate) fn reset_after_recovery(&self) {
        let mut inner = self.lock();
        inner.error_count = 0;
        inner.recovery_attempts = 0;
    }

    /// Build a health snapshot carrying this core's counters.
    pub fn health(
        &self,
        healthy: bool,
        last_error: Option<String>,
        metrics: BTreeMap<String, serde_json::Value>,
    ) -> ServiceHealth {
        let inner = self.lock();
        ServiceHealth {
            healthy,
            last_check: Utc::now(),
            error_count: inner.error_count,
            last_error: last_error.or_else(|| inner.last_error.clone()),
            metrics,
            recovery_attempts: inner.recovery_attempts,
            last_recovery_time: inner.last_recovery_time,
        }
    }

    pub fn add_dependency(&self, service: Arc<dyn Service>) {
        let mut deps = self
            .dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if deps.iter().any(|d| d.name() == service.name()) {
            log_warn!(self.logger, "Dependency {} already exists", service.name());
            return;
        }
        log_info!(self.logger, "Added dependency: {}", service.name());
        deps.push(service);
    }

    pub fn remove_dependency(&self, name: &str) {
        let mut deps = self
            .dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match deps.iter().position(|d| d.name() == name) {
            Some(idx) => {
                deps.remove(idx);
                log_info!(self.logger, "Removed dependency: {}", name);
            }
            None => log_warn!(self.logger, "Dependency {} not found", name),
        }
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// True when every direct dependency reports healthy.
    ///
    /// Only directly registered dependencies are consulted. A check that does
    /// not answer within [`DEPENDENCY_CHECK_TIMEOUT`] counts as unhealthy.
    pub async fn check_dependencies(&self) -> bool {
        let deps: Vec<Arc<dyn Service>> = self
            .dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if deps.is_empty() {
            return true;
        }

        let mut failed = Vec::new();
        for dep in deps {
            let healthy =
                match tokio::time::timeout(DEPENDENCY_CHECK_TIMEOUT, dep.check_health()).await {
                    Ok(health) => health.healthy,
                    Err(_) => {
                        log_warn!(
                            self.logger,
                            "Dependency {} health check timed out",
                            dep.name()
                        );
                        false
                    }
                };
            if !healthy {
                log_error!(self.logger, "Dependency {} health check failed", dep.name());
                failed.push(dep.name().to_string());
            }
        }

        if failed.is_empty() {
            return true;
        }
        self.set_last_error(Some(format!("Failed dependencies: {}", failed.join(", "))));
        false
    }
}

/// A named, supervised unit with a start/stop/health lifecycle.
///
/// `start` for a looping service *is* the loop: it returns only once the loop
/// has ended (stopped, cancelled or fatally failed). Implementations must set
/// `Running` or `Error` on the core before their first suspension point after
/// setup.
#[async_trait]
pub trait Service: Send + Sync {
    fn core(&self) -> &ServiceCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> ServiceState {
        self.core().state()
    }

    fn is_critical(&self) -> bool {
        self.core().is_critical()
    }

    fn uptime(&self) -> Option<Duration> {
        self.core().uptime()
    }

    async fn start(&self) -> Result<()>;

    /// Idempotent; releases every backend handle even on failure paths.
    async fn stop(&self) -> Result<()>;

    /// Side-effect free and quick. Must report unhealthy whenever the state
    /// is not `Running`, without touching any backend.
    async fn check_health(&self) -> ServiceHealth;

    /// Queue-injection hook; returns true when the service took the sender.
    fn attach_queue(&self, _queue: SnapshotSender) -> bool {
        false
    }

    fn add_dependency(&self, service: Arc<dyn Service>) {
        self.core().add_dependency(service);
    }

    fn remove_dependency(&self, name: &str) {
        self.core().remove_dependency(name);
    }

    async fn check_dependencies(&self) -> bool {
        self.core().check_dependencies().await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MockService, StartBehavior};
    use super::*;
    use crate::log::{CapturingLogger, LogLevel};

    #[test]
    fn test_service_state_helpers() {
        assert!(ServiceState::Running.is_running());
        assert!(!ServiceState::Recovering.is_running());
        assert!(ServiceState::Stopped.is_stopped());
        assert!(ServiceState::Stopping.is_stopped());
        assert!(!ServiceState::Error.is_stopped());
        assert_eq!(ServiceState::Init.as_str(), "initialized");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceState::Recovering).unwrap();
        assert_eq!(json, "\"recovering\"");
    }

    #[test]
    fn test_core_starts_in_init_with_clean_counters() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        assert_eq!(core.state(), ServiceState::Init);
        assert_eq!(core.error_count(), 0);
        assert_eq!(core.recovery_attempts(), 0);
        assert!(core.uptime().is_none());
        assert!(!core.is_critical());
    }

    #[test]
    fn test_transition_only_from_allowed_states() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        assert!(!core.transition(&[ServiceState::Running], ServiceState::Stopping));
        assert!(core.transition(&[ServiceState::Init], ServiceState::Starting));
        assert_eq!(core.state(), ServiceState::Starting);
    }

    #[test]
    fn test_health_snapshot_carries_counters() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        core.record_error("boom");
        core.record_error("boom again");
        core.begin_recovery();

        let health = core.health(false, None, BTreeMap::new());
        assert!(!health.healthy);
        assert_eq!(health.error_count, 2);
        assert_eq!(health.last_error.as_deref(), Some("boom again"));
        assert_eq!(health.recovery_attempts, 1);
        assert!(health.last_recovery_time.is_some());

        core.reset_after_recovery();
        assert_eq!(core.error_count(), 0);
        assert_eq!(core.recovery_attempts(), 0);
    }

    #[test]
    fn test_duplicate_and_missing_dependency_warn() {
        let logger = Arc::new(CapturingLogger::new());
        let core = ServiceCore::new("svc", logger.clone());
        let dep: Arc<dyn Service> =
            Arc::new(MockService::new("dep", StartBehavior::RunUntilStopped));

        core.add_dependency(Arc::clone(&dep));
        core.add_dependency(Arc::clone(&dep));
        core.remove_dependency("nope");

        assert_eq!(core.dependency_names(), vec!["dep".to_string()]);
        assert_eq!(logger.count(LogLevel::Warn, "already exists"), 1);
        assert_eq!(logger.count(LogLevel::Warn, "not found"), 1);

        core.remove_dependency("dep");
        assert!(core.dependency_names().is_empty());
    }

    #[tokio::test]
    async fn test_check_dependencies_without_dependencies() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        assert!(core.check_dependencies().await);
    }

    #[tokio::test]
    async fn test_check_dependencies_aggregates_failures() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        // never started, so unhealthy
        let a = Arc::new(MockService::new("a", StartBehavior::RunUntilStopped));
        let b = Arc::new(MockService::new("b", StartBehavior::RunUntilStopped));
        core.add_dependency(a);
        core.add_dependency(b);

        assert!(!core.check_dependencies().await);
        assert_eq!(core.last_error().as_deref(), Some("Failed dependencies: a, b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_dependencies_counts_hung_check_as_unhealthy() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        let dep = Arc::new(MockService::new("slow", StartBehavior::RunUntilStopped));
        dep.set_hang_health(true);
        core.add_dependency(dep);

        assert!(!core.check_dependencies().await);
        assert_eq!(core.last_error().as_deref(), Some("Failed dependencies: slow"));
    }

    #[tokio::test]
    async fn test_check_dependencies_healthy_when_all_running() {
        let core = ServiceCore::new("svc", crate::log::noop_logger());
        let dep = Arc::new(MockService::new("dep", StartBehavior::RunUntilStopped));
        let runner = Arc::clone(&dep);
        let task = tokio::spawn(async move { runner.start().await });
        while dep.state() != ServiceState::Running {
            tokio::task::yield_now().await;
        }
        core.add_dependency(dep.clone());

        assert!(core.check_dependencies().await);

        dep.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
