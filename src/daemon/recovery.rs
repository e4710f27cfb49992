//! Bounded-retry recovery of a failed service.

use super::service::{Service, ServiceState};
use crate::error::Result;
use crate::log::Logger;
use crate::{log_error, log_info, log_warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How the wait before a restart grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// `delay * factor^(attempt - 1)`, capped at `max`
    Exponential { factor: u32, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffPolicy,
    /// Pause between restarting and checking health
    pub settle: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            backoff: BackoffPolicy::Fixed,
            settle: Duration::from_secs(1),
        }
    }
}

impl RecoveryPolicy {
    /// Delay before restart number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffPolicy::Fixed => self.delay,
            BackoffPolicy::Exponential { factor, max } => {
                let multiplier = factor.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(multiplier).min(max)
            }
        }
    }
}

/// Outcome of one [`recover`] call.
#[derive(Debug)]
pub struct Recovery {
    pub recovered: bool,
    /// No attempts were left, the service was not touched
    pub exhausted: bool,
    /// The restarted `start()` task, when a restart was attempted
    pub task: Option<JoinHandle<Result<()>>>,
}

impl Recovery {
    fn exhausted() -> Self {
        Self {
            recovered: false,
            exhausted: true,
            task: None,
        }
    }
}

/// Run one stop / wait / restart / verify cycle on `service`.
///
/// Once the service has used up its attempts it is left in `Error` and every
/// further call returns immediately without touching the service.
pub async fn recover(service: &Arc<dyn Service>) -> Recovery {
    let core = service.core();
    let logger = Arc::clone(core.logger());
    let policy = core.recovery_policy().clone();
    let name = service.name().to_string();

    if core.recovery_attempts() >= policy.max_attempts {
        core.set_state(ServiceState::Error);
        log_error!(
            logger,
            "Service '{}' failed after {} recovery attempts",
            name,
            policy.max_attempts
        );
        return Recovery::exhausted();
    }

    let attempt = core.begin_recovery();
    core.set_state(ServiceState::Recovering);
    log_info!(
        logger,
        "Recovering service '{}' (attempt {}/{})",
        name,
        attempt,
        policy.max_attempts
    );

    if let Err(e) = service.stop().await {
        log_warn!(logger, "Failed to stop '{}' before restart: {}", name, e);
    }

    tokio::time::sleep(policy.delay_for(attempt)).await;

    let runner = Arc::clone(service);
    let task = tokio::spawn(async move { runner.start().await });

    tokio::time::sleep(policy.settle).await;

    let health = service.check_health().await;
    if health.healthy {
        core.set_state(ServiceState::Running);
        core.reset_after_recovery();
        log_info!(logger, "Service '{}' recovered", name);
        return Recovery {
            recovered: true,
            exhausted: false,
            task: Some(task),
        };
    }

    if !task.is_finished() {
        task.abort();
    }
    core.set_state(ServiceState::Error);
    log_error!(
        logger,
        "Recovery attempt {} for '{}' failed: {}",
        attempt,
        name,
        health.last_error.as_deref().unwrap_or("unhealthy after restart")
    );
    Recovery {
        recovered: false,
        exhausted: false,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::service::testing::{MockService, StartBehavior};
    use crate::daemon::service::ServiceCore;

    fn policy(max_attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts,
            delay: Duration::from_secs(5),
            backoff: BackoffPolicy::Fixed,
            settle: Duration::from_secs(1),
        }
    }

    fn mock(behavior: StartBehavior, max_attempts: u32) -> Arc<MockService> {
        let core = ServiceCore::new("svc", crate::log::noop_logger())
            .with_recovery_policy(policy(max_attempts));
        Arc::new(MockService::with_core(core, behavior))
    }

    #[test]
    fn test_fixed_delay_does_not_grow() {
        let p = policy(3);
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let p = RecoveryPolicy {
            backoff: BackoffPolicy::Exponential {
                factor: 2,
                max: Duration::from_secs(15),
            },
            ..policy(5)
        };
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(2), Duration::from_secs(10));
        assert_eq!(p.delay_for(3), Duration::from_secs(15));
        assert_eq!(p.delay_for(30), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_recovery_resets_counters() {
        let svc = mock(StartBehavior::RunUntilStopped, 3);
        svc.core().record_error("sample failed");
        svc.core().set_state(ServiceState::Error);
        let service: Arc<dyn Service> = svc.clone();

        let outcome = recover(&service).await;

        assert!(outcome.recovered);
        assert_eq!(svc.state(), ServiceState::Running);
        assert_eq!(svc.core().error_count(), 0);
        assert_eq!(svc.core().recovery_attempts(), 0);
        assert!(svc.core().last_recovery_time().is_some());
        assert_eq!(svc.starts(), 1);
        assert_eq!(svc.stops(), 1);

        svc.stop().await.unwrap();
        outcome.task.unwrap().await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_exhaustion_is_permanent() {
        let svc = mock(StartBehavior::Fail, 3);
        let service: Arc<dyn Service> = svc.clone();

        for attempt in 1..=3 {
            let outcome = recover(&service).await;
            assert!(!outcome.recovered);
            assert_eq!(svc.state(), ServiceState::Error);
            assert_eq!(svc.core().recovery_attempts(), attempt);
        }
        assert_eq!(svc.starts(), 3);
        assert_eq!(svc.stops(), 3);

        let started = tokio::time::Instant::now();
        let outcome = recover(&service).await;
        assert!(!outcome.recovered);
        assert!(outcome.exhausted);
        assert!(outcome.task.is_none());
        assert_eq!(svc.state(), ServiceState::Error);
        assert_eq!(svc.starts(), 3);
        assert_eq!(svc.stops(), 3);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let health = service.check_health().await;
        assert!(!health.healthy);
        assert_eq!(health.recovery_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_waits_delay_then_settle() {
        let svc = mock(StartBehavior::Fail, 1);
        let service: Arc<dyn Service> = svc.clone();

        let started = tokio::time::Instant::now();
        let outcome = recover(&service).await;

        assert!(!outcome.recovered);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_restart_is_aborted() {
        let svc = mock(StartBehavior::RunUntilStopped, 2);
        svc.set_healthy(false);
        let service: Arc<dyn Service> = svc.clone();

        let outcome = recover(&service).await;

        assert!(!outcome.recovered);
        assert_eq!(svc.state(), ServiceState::Error);
        let joined = outcome.task.unwrap().await;
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_failure_after_healthy_run() {
        let svc = mock(StartBehavior::RunUntilStopped, 3);
        let runner = Arc::clone(&svc);
        let first = tokio::spawn(async move { runner.start().await });
        tokio::task::yield_now().await;
        assert_eq!(svc.state(), ServiceState::Running);

        svc.set_behavior(StartBehavior::Fail);
        let service: Arc<dyn Service> = svc.clone();
        let outcome = recover(&service).await;

        assert!(!outcome.recovered);
        assert!(!outcome.exhausted);
        assert_eq!(svc.state(), ServiceState::Error);
        assert_eq!(svc.core().recovery_attempts(), 1);
        assert_eq!(svc.starts(), 2);
        first.await.unwrap().unwrap();
        assert!(outcome.task.unwrap().await.unwrap().is_err());
    }
}
