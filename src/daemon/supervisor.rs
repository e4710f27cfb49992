use super::health::HealthStatus;
use super::recovery;
use super::service::{Service, ServiceHealth, ServiceState};
use super::shutdown::{ShutdownCoordinator, ShutdownHandle};
use crate::error::{AgentError, Result};
use crate::log::{Logger, SharedLogger};
use crate::telemetry::queue::SnapshotSender;
use crate::{log_debug, log_error, log_info, log_warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

/// Supervisor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Cadence of the supervisory loop
    pub poll_interval: Duration,
    /// Bound on waiting for cancelled service tasks during stop
    pub shutdown_timeout: Duration,
    /// Translate SIGINT/SIGTERM (Ctrl+C elsewhere) into `stop()`
    pub install_signal_handlers: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            install_signal_handlers: true,
        }
    }
}

/// Service summary for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
    pub critical: bool,
    pub uptime_secs: Option<u64>,
    pub dependencies: Vec<String>,
}

struct ServiceTask {
    name: String,
    critical: bool,
    handle: JoinHandle<Result<()>>,
}

/// Owns the service registry and runs one task per service.
///
/// Crashed services are observed and logged, never restarted here; restarting
/// is left to [`recovery::recover`] via [`DaemonSupervisor::recover_service`].
pub struct DaemonSupervisor {
    options: SupervisorOptions,
    queue: SnapshotSender,
    logger: SharedLogger,
    services: RwLock<Vec<Arc<dyn Service>>>,
    tasks: Mutex<Vec<ServiceTask>>,
    running: AtomicBool,
    /// Recoveries in flight; their service has no tracked task meanwhile
    recovering: AtomicUsize,
    started_at: StdMutex<Option<Instant>>,
    shutdown: StdMutex<Option<ShutdownHandle>>,
    stopped: watch::Sender<bool>,
}

impl DaemonSupervisor {
    pub fn new(options: SupervisorOptions, queue: SnapshotSender, logger: SharedLogger) -> Self {
        let (stopped, _) = watch::channel(true);
        Self {
            options,
            queue,
            logger,
            services: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            recovering: AtomicUsize::new(0),
            started_at: StdMutex::new(None),
            shutdown: StdMutex::new(None),
            stopped,
        }
    }

    /// Add a service to the registry and hand it the shared queue.
    ///
    /// Registration is only allowed while the daemon is not running.
    pub async fn register_service(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        if self.is_running() {
            log_warn!(
                self.logger,
                "Cannot register '{}' while the daemon is running",
                name
            );
            return Err(AgentError::AlreadyRunning);
        }

        let mut services = self.services.write().await;
        if services.iter().any(|s| s.name() == name) {
            log_warn!(self.logger, "Service '{}' is already registered", name);
            return Err(AgentError::DuplicateService(name));
        }

        if service.attach_queue(self.queue.clone()) {
            log_debug!(self.logger, "Attached snapshot queue to '{}'", name);
        }
        services.push(service);
        log_info!(self.logger, "Registered service: {}", name);
        Ok(())
    }

    /// Run every registered service and supervise them until stopped.
    ///
    /// Returns `Ok(())` after a requested stop has completed. Returns an error
    /// when every task died while services remain registered, or when a
    /// critical service's task exited; the daemon is stopped first in both
    /// cases.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Held until every task is spawned: a concurrent stop() blocks on it
        // and then drains the complete set.
        let mut tasks = self.tasks.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            log_warn!(self.logger, "Daemon is already running");
            return Ok(());
        }
        self.stopped.send_replace(false);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let mut shutdown = ShutdownCoordinator::new();
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown.handle());

        let services = self.services.read().await.clone();
        log_info!(self.logger, "Starting daemon with {} services", services.len());
        for service in services {
            tasks.push(spawn_service(service));
        }
        drop(tasks);

        let signals = if self.options.install_signal_handlers {
            self.install_signal_handlers(shutdown.handle())
        } else {
            None
        };

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    log_debug!(self.logger, "Shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Some(err) = self.supervise_once().await {
                        break Err(err);
                    }
                }
            }
        };

        self.stop().await?;
        self.wait_stopped().await;

        if let Some(task) = signals {
            task.abort();
        }
        outcome
    }

    /// One pass of the supervisory loop: reap finished tasks and detect failure.
    async fn supervise_once(&self) -> Option<AgentError> {
        let finished = {
            let mut tasks = self.tasks.lock().await;
            let (finished, active): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|t| t.handle.is_finished());
            *tasks = active;
            finished
        };

        let mut critical = None;
        for task in finished {
            let result = task.handle.await;
            self.log_task_exit(&task.name, result);
            if task.critical && critical.is_none() {
                critical = Some(task.name);
            }
        }

        if let Some(name) = critical {
            log_error!(self.logger, "Critical service '{}' exited, stopping daemon", name);
            return Some(AgentError::CriticalServiceFailed(name));
        }

        let active = self.tasks.lock().await.len() + self.recovering.load(Ordering::SeqCst);
        let registered = self.services.read().await.len();
        if active == 0 && registered > 0 {
            log_error!(
                self.logger,
                "All service tasks have exited ({} registered), stopping daemon",
                registered
            );
            return Some(AgentError::AllServicesFailed { registered });
        }
        None
    }

    /// Cancel every task, wait a bounded time, then stop every service.
    ///
    /// Idempotent. A timeout while waiting is logged with the pending task
    /// names and does not fail the stop.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            log_debug!(self.logger, "Daemon is not running");
            return Ok(());
        }
        log_info!(self.logger, "Stopping daemon...");

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if let Some(handle) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.shutdown();
        }

        for task in &tasks {
            if !task.handle.is_finished() {
                task.handle.abort();
            }
        }

        let drained = tokio::time::timeout(self.options.shutdown_timeout, async {
            for task in tasks.iter_mut() {
                let result = (&mut task.handle).await;
                self.log_task_exit(&task.name, result);
            }
        })
        .await;

        if drained.is_err() {
            let pending: Vec<String> = tasks
                .iter()
                .filter(|t| !t.handle.is_finished())
                .map(|t| t.name.clone())
                .collect();
            log_warn!(self.logger, "{}", AgentError::ShutdownTimeout { pending });
        }

        let services = self.services.read().await.clone();
        for service in services {
            if let Err(e) = service.stop().await {
                log_error!(self.logger, "Failed to stop service '{}': {}", service.name(), e);
            }
        }

        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.stopped.send_replace(true);
        log_info!(self.logger, "Daemon stopped");
        Ok(())
    }

    async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // `self.stopped` keeps the channel open.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    #[cfg(unix)]
    fn install_signal_handlers(&self, handle: ShutdownHandle) -> Option<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let signals = signal(SignalKind::terminate())
            .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));
        let (mut sigterm, mut sigint) = match signals {
            Ok(pair) => pair,
            Err(e) => {
                log_warn!(self.logger, "Could not install signal handlers: {}", e);
                return None;
            }
        };

        let logger = Arc::clone(&self.logger);
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => log_info!(logger, "Received SIGTERM"),
                _ = sigint.recv() => log_info!(logger, "Received SIGINT"),
            }
            handle.shutdown();
        }))
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self, handle: ShutdownHandle) -> Option<JoinHandle<()>> {
        let logger = Arc::clone(&self.logger);
        Some(tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log_info!(logger, "Received Ctrl+C");
                    handle.shutdown();
                }
                Err(e) => log_warn!(logger, "Could not install signal handlers: {}", e),
            }
        }))
    }

    fn log_task_exit(&self, name: &str, result: std::result::Result<Result<()>, JoinError>) {
        match result {
            Ok(Ok(())) => log_info!(self.logger, "Service '{}' task exited", name),
            Ok(Err(e)) => log_error!(self.logger, "Service '{}' failed: {}", name, e),
            Err(e) if e.is_cancelled() => {
                log_debug!(self.logger, "Service '{}' task cancelled", name)
            }
            Err(e) => log_error!(self.logger, "Service '{}' task panicked: {}", name, e),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Time since `start`, while running
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub async fn list(&self) -> Vec<ServiceInfo> {
        self.services
            .read()
            .await
            .iter()
            .map(|s| ServiceInfo {
                name: s.name().to_string(),
                state: s.state(),
                critical: s.is_critical(),
                uptime_secs: s.uptime().map(|d| d.as_secs()),
                dependencies: s.core().dependency_names(),
            })
            .collect()
    }

    pub async fn check_health(&self, name: &str) -> Result<ServiceHealth> {
        let service = self
            .get(name)
            .await
            .ok_or_else(|| AgentError::ServiceNotFound(name.to_string()))?;
        Ok(service.check_health().await)
    }

    /// Health of every service, in registration order
    pub async fn health_report(&self) -> Vec<(String, ServiceHealth)> {
        let services = self.services.read().await.clone();
        let mut report = Vec::with_capacity(services.len());
        for service in services {
            let health = service.check_health().await;
            report.push((service.name().to_string(), health));
        }
        report
    }

    pub async fn health_status(&self) -> HealthStatus {
        let services = self.services.read().await.clone();
        HealthStatus::from_services(&services).await
    }

    /// Run one recovery cycle on `name`.
    ///
    /// While the daemon runs, the restarted task replaces the service's old
    /// task in the supervised set. Fails with `RecoveryExhausted` once the
    /// service has no attempts left.
    pub async fn recover_service(&self, name: &str) -> Result<bool> {
        let service = self
            .get(name)
            .await
            .ok_or_else(|| AgentError::ServiceNotFound(name.to_string()))?;

        let _in_flight = RecoveryInFlight::enter(&self.recovering);
        let previous: Vec<ServiceTask> = {
            let mut tasks = self.tasks.lock().await;
            let (previous, others): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|t| t.name == name);
            *tasks = others;
            previous
        };

        let outcome = recovery::recover(&service).await;
        if outcome.exhausted {
            self.tasks.lock().await.extend(previous);
            return Err(AgentError::RecoveryExhausted {
                service: name.to_string(),
                attempts: service.core().recovery_policy().max_attempts,
            });
        }

        for task in previous {
            if !task.handle.is_finished() {
                task.handle.abort();
            }
            let result = task.handle.await;
            self.log_task_exit(&task.name, result);
        }

        if let Some(handle) = outcome.task {
            if self.is_running() {
                self.tasks.lock().await.push(ServiceTask {
                    name: name.to_string(),
                    critical: service.is_critical(),
                    handle,
                });
            } else {
                log_debug!(
                    self.logger,
                    "Daemon not running, '{}' restarted unsupervised",
                    name
                );
            }
        }
        Ok(outcome.recovered)
    }
}

/// Counts a recovery as in flight until dropped, including on cancellation.
struct RecoveryInFlight<'a>(&'a AtomicUsize);

impl<'a> RecoveryInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RecoveryInFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_service(service: Arc<dyn Service>) -> ServiceTask {
    let name = service.name().to_string();
    let critical = service.is_critical();
    let handle = tokio::spawn(async move { service.start().await });
    ServiceTask {
        name,
        critical,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::recovery::RecoveryPolicy;
    use crate::daemon::service::testing::{MockService, StartBehavior};
    use crate::daemon::service::ServiceCore;
    use crate::log::{CapturingLogger, LogLevel};
    use crate::telemetry::queue::snapshot_queue;

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            install_signal_handlers: false,
        }
    }

    fn supervisor(logger: SharedLogger) -> Arc<DaemonSupervisor> {
        let (tx, _rx) = snapshot_queue(4, crate::log::noop_logger());
        Arc::new(DaemonSupervisor::new(options(), tx, logger))
    }

    fn mock(name: &str, behavior: StartBehavior) -> Arc<MockService> {
        Arc::new(MockService::new(name, behavior))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let logger = Arc::new(CapturingLogger::new());
        let sup = supervisor(logger.clone());

        sup.register_service(mock("a", StartBehavior::RunUntilStopped))
            .await
            .unwrap();
        let err = sup
            .register_service(mock("a", StartBehavior::RunUntilStopped))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::DuplicateService(ref n) if n == "a"));
        assert_eq!(sup.service_names().await, vec!["a".to_string()]);
        assert_eq!(logger.count(LogLevel::Warn, "already registered"), 1);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let sup = supervisor(crate::log::noop_logger());
        let svc = mock("a", StartBehavior::RunUntilStopped);
        sup.register_service(svc.clone()).await.unwrap();

        sup.stop().await.unwrap();
        sup.stop().await.unwrap();

        assert_eq!(svc.stops(), 0);
        assert!(!sup.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reaches_every_service_exactly_once() {
        let sup = supervisor(crate::log::noop_logger());
        let a = mock("a", StartBehavior::RunUntilStopped);
        let b = mock("b", StartBehavior::ExitAfterRunning);
        let c = mock("c", StartBehavior::RunUntilStopped);
        for svc in [&a, &b, &c] {
            sup.register_service(svc.clone()).await.unwrap();
        }

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;
        assert!(sup.is_running());
        assert_eq!(a.state(), ServiceState::Running);

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();

        for svc in [&a, &b, &c] {
            assert_eq!(svc.starts(), 1);
            assert_eq!(svc.stops(), 1);
            assert_eq!(svc.state(), ServiceState::Stopped);
        }
        assert!(!sup.is_running());
        assert!(sup.uptime().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let logger = Arc::new(CapturingLogger::new());
        let sup = supervisor(logger.clone());
        let a = mock("a", StartBehavior::RunUntilStopped);
        sup.register_service(a.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        sup.start().await.unwrap();
        assert_eq!(logger.count(LogLevel::Warn, "already running"), 1);
        assert_eq!(a.starts(), 1);

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tasks_exiting_stops_daemon() {
        let sup = supervisor(crate::log::noop_logger());
        let a = mock("a", StartBehavior::Fail);
        let b = mock("b", StartBehavior::Fail);
        sup.register_service(a.clone()).await.unwrap();
        sup.register_service(b.clone()).await.unwrap();

        let err = sup.start().await.unwrap_err();

        assert!(matches!(err, AgentError::AllServicesFailed { registered: 2 }));
        assert!(!sup.is_running());
        assert_eq!(a.stops(), 1);
        assert_eq!(b.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_task_exiting_is_only_logged() {
        let logger = Arc::new(CapturingLogger::new());
        let sup = supervisor(logger.clone());
        let a = mock("a", StartBehavior::Fail);
        let b = mock("b", StartBehavior::RunUntilStopped);
        sup.register_service(a.clone()).await.unwrap();
        sup.register_service(b.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(sup.is_running());
        assert_eq!(logger.count(LogLevel::Error, "Service 'a' failed"), 1);
        assert_eq!(a.starts(), 1);

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_service_exit_stops_daemon() {
        let sup = supervisor(crate::log::noop_logger());
        let core = ServiceCore::new("critical", crate::log::noop_logger()).with_critical(true);
        let critical = Arc::new(MockService::with_core(core, StartBehavior::ExitAfterRunning));
        let other = mock("other", StartBehavior::RunUntilStopped);
        sup.register_service(critical.clone()).await.unwrap();
        sup.register_service(other.clone()).await.unwrap();

        let err = sup.start().await.unwrap_err();

        assert!(matches!(err, AgentError::CriticalServiceFailed(ref n) if n == "critical"));
        assert_eq!(other.stops(), 1);
        assert_eq!(critical.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_services_idles_until_stopped() {
        let sup = supervisor(crate::log::noop_logger());
        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(sup.is_running());
        assert!(sup.uptime().unwrap() >= Duration::from_secs(29));

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_service_stop_does_not_abort_shutdown() {
        let logger = Arc::new(CapturingLogger::new());
        let sup = supervisor(logger.clone());
        let a = mock("a", StartBehavior::RunUntilStopped);
        let b = mock("b", StartBehavior::RunUntilStopped);
        a.set_fail_stop(true);
        sup.register_service(a.clone()).await.unwrap();
        sup.register_service(b.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();

        assert_eq!(b.stops(), 1);
        assert_eq!(b.state(), ServiceState::Stopped);
        assert_eq!(logger.count(LogLevel::Error, "Failed to stop service 'a'"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_while_running_is_rejected() {
        let sup = supervisor(crate::log::noop_logger());
        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        let err = sup
            .register_service(mock("late", StartBehavior::RunUntilStopped))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AlreadyRunning));

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_diagnostics_for_unknown_service() {
        let sup = supervisor(crate::log::noop_logger());
        let err = sup.check_health("missing").await.unwrap_err();
        assert!(matches!(err, AgentError::ServiceNotFound(_)));
        let err = sup.recover_service("missing").await.unwrap_err();
        assert!(matches!(err, AgentError::ServiceNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_health_report() {
        let sup = supervisor(crate::log::noop_logger());
        let a = mock("a", StartBehavior::RunUntilStopped);
        let b = mock("b", StartBehavior::RunUntilStopped);
        b.set_healthy(false);
        sup.register_service(a.clone()).await.unwrap();
        sup.register_service(b.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        let infos = sup.list().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "a");
        assert_eq!(infos[0].state, ServiceState::Running);

        let report = sup.health_report().await;
        assert!(report[0].1.healthy);
        assert!(!report[1].1.healthy);

        let status = sup.health_status().await;
        assert_eq!(status.running, 2);
        assert_eq!(status.unhealthy, vec!["b".to_string()]);

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_service_is_supervised_again() {
        let sup = supervisor(crate::log::noop_logger());
        let core = ServiceCore::new("a", crate::log::noop_logger()).with_recovery_policy(
            RecoveryPolicy {
                delay: Duration::from_secs(1),
                ..RecoveryPolicy::default()
            },
        );
        let a = Arc::new(MockService::with_core(core, StartBehavior::RunUntilStopped));
        sup.register_service(a.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        assert!(sup.recover_service("a").await.unwrap());
        assert_eq!(a.starts(), 2);
        assert_eq!(a.state(), ServiceState::Running);

        // the old task's exit must not count as total failure
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(sup.is_running());

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
        assert_eq!(a.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_racing_start_leaves_nothing_running() {
        let sup = supervisor(crate::log::noop_logger());
        let a = mock("a", StartBehavior::RunUntilStopped);
        sup.register_service(a.clone()).await.unwrap();

        // start() parks on the registry while stop() arrives
        let registry = sup.services.write().await;
        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;
        let stopper = Arc::clone(&sup);
        let stopping = tokio::spawn(async move { stopper.stop().await });
        settle().await;
        drop(registry);

        stopping.await.unwrap().unwrap();
        daemon.await.unwrap().unwrap();
        settle().await;

        assert!(!sup.is_running());
        assert_eq!(a.stops(), 1);
        assert_ne!(a.state(), ServiceState::Running);
        assert!(sup.tasks.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_recovery_keeps_failure_detection() {
        let sup = supervisor(crate::log::noop_logger());
        let a = mock("a", StartBehavior::RunUntilStopped);
        sup.register_service(a.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        // default recovery delay is 5s, give up after 1s
        let cancelled = tokio::time::timeout(Duration::from_secs(1), sup.recover_service("a")).await;
        assert!(cancelled.is_err());
        assert_eq!(sup.recovering.load(Ordering::SeqCst), 0);

        // the old task is gone and nothing replaced it
        let err = daemon.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::AllServicesFailed { registered: 1 }));
        assert!(!sup.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_without_attempts_left_is_an_error() {
        let sup = supervisor(crate::log::noop_logger());
        let core = ServiceCore::new("a", crate::log::noop_logger()).with_recovery_policy(
            RecoveryPolicy {
                max_attempts: 0,
                ..RecoveryPolicy::default()
            },
        );
        let a = Arc::new(MockService::with_core(core, StartBehavior::RunUntilStopped));
        sup.register_service(a.clone()).await.unwrap();

        let runner = Arc::clone(&sup);
        let daemon = tokio::spawn(async move { runner.start().await });
        settle().await;

        let err = sup.recover_service("a").await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::RecoveryExhausted { ref service, attempts: 0 } if service == "a"
        ));
        assert_eq!(a.starts(), 1);
        assert_eq!(sup.tasks.lock().await.len(), 1);

        sup.stop().await.unwrap();
        daemon.await.unwrap().unwrap();
    }
}
