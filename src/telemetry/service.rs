//! The collection service: samples the host backends on a timer and publishes
//! each snapshot to the handoff queue.

use super::backends::{BackendError, BackendKind, BackendSet};
use super::queue::SnapshotSender;
use super::snapshot::MetricsSnapshot;
use crate::config::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use crate::daemon::recovery::RecoveryPolicy;
use crate::daemon::service::{Service, ServiceCore, ServiceHealth, ServiceState};
use crate::error::{AgentError, Result};
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_error, log_info, log_trace, log_warn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

pub const DEFAULT_SERVICE_NAME: &str = "gpu_monitor";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
/// How long `stop` waits for the loop to wind down
pub const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// No snapshot for this many intervals means the loop has stalled
const STALL_FACTOR: u32 = 3;

#[derive(Debug, Default)]
struct CollectionStats {
    sequence: u64,
    passes: u64,
    failed_passes: u64,
    last_collection: Option<(Instant, DateTime<Utc>)>,
    running_since: Option<Instant>,
    primary: Option<BackendKind>,
    availability: Vec<(BackendKind, bool)>,
}

/// Clears the loop flag however `start` ends, including abort.
struct LoopGuard<'a>(&'a watch::Sender<bool>);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

enum Wake {
    Elapsed,
    Stopped,
}

/// Periodic hardware sampler.
///
/// `start` runs the sampling loop and returns only once it ends. Passes are
/// serialised by the lock around the backend set, so a pass triggered through
/// [`CollectionService::collect_now`] never overlaps one from the loop.
pub struct CollectionService {
    core: ServiceCore,
    logger: SharedLogger,
    backends: Mutex<BackendSet>,
    queue: StdMutex<Option<SnapshotSender>>,
    interval: watch::Sender<Duration>,
    stop_requested: watch::Sender<bool>,
    loop_running: watch::Sender<bool>,
    stats: StdMutex<CollectionStats>,
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(
        Duration::from_secs(MIN_INTERVAL_SECS),
        Duration::from_secs(MAX_INTERVAL_SECS),
    )
}

impl CollectionService {
    /// Sampler over the backends detected for this host.
    pub fn new(name: impl Into<String>, interval: Duration, logger: SharedLogger) -> Self {
        let backends = BackendSet::detect(logger.clone());
        Self::with_backends(name, interval, backends, logger)
    }

    pub fn with_backends(
        name: impl Into<String>,
        interval: Duration,
        backends: BackendSet,
        logger: SharedLogger,
    ) -> Self {
        let (interval, _) = watch::channel(clamp_interval(interval));
        let (stop_requested, _) = watch::channel(false);
        let (loop_running, _) = watch::channel(false);
        Self {
            core: ServiceCore::new(name, logger.clone()),
            logger,
            backends: Mutex::new(backends),
            queue: StdMutex::new(None),
            interval,
            stop_requested,
            loop_running,
            stats: StdMutex::new(CollectionStats::default()),
        }
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.core.set_recovery_policy(policy);
        self
    }

    pub fn with_critical(self, critical: bool) -> Self {
        self.core.set_critical(critical);
        self
    }

    fn stats(&self) -> MutexGuard<'_, CollectionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// Change the sampling interval. A sleeping loop picks it up immediately.
    pub fn set_interval(&self, interval: Duration) {
        let clamped = clamp_interval(interval);
        if clamped != interval {
            log_warn!(
                self.logger,
                "Interval {:?} out of range, using {:?}",
                interval,
                clamped
            );
        }
        let previous = self.interval.send_replace(clamped);
        if previous != clamped {
            log_info!(
                self.logger,
                "Monitoring interval changed: {}s -> {}s",
                previous.as_secs_f64(),
                clamped.as_secs_f64()
            );
        }
    }

    /// Snapshots dropped by the queue so far
    pub fn dropped_snapshots(&self) -> u64 {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|q| q.dropped())
            .unwrap_or(0)
    }

    pub fn last_collection(&self) -> Option<DateTime<Utc>> {
        self.stats().last_collection.map(|(_, at)| at)
    }

    /// Run one sampling pass now, outside the timer.
    pub async fn collect_now(&self) -> Result<MetricsSnapshot> {
        Ok(self.collect_pass().await?)
    }

    /// One guarded pass: query, record, publish.
    async fn collect_pass(&self) -> std::result::Result<MetricsSnapshot, BackendError> {
        let mut backends = self.backends.lock().await;
        let sequence = {
            let mut stats = self.stats();
            stats.sequence += 1;
            stats.sequence
        };

        let result = backends.collect(sequence).await;
        {
            let mut stats = self.stats();
            stats.primary = backends.primary();
            stats.availability = backends.availability();
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats().failed_passes += 1;
                self.core.record_error(&e);
                return Err(e);
            }
        };

        {
            let mut stats = self.stats();
            stats.passes += 1;
            stats.last_collection = Some((Instant::now(), snapshot.timestamp));
        }
        log_trace!(
            self.logger,
            "Collected snapshot #{} from {} ({} devices, {} active)",
            snapshot.sequence,
            snapshot.source,
            snapshot.device_count,
            snapshot.active_device_count
        );

        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match queue {
            Some(queue) => {
                queue.publish(snapshot.clone());
            }
            None => log_debug!(self.logger, "No queue attached, snapshot not published"),
        }
        Ok(snapshot)
    }

    /// Sleep until the next pass is due, waking early on stop.
    ///
    /// The deadline is recomputed from `since` whenever the interval changes.
    async fn sleep_until_due(
        &self,
        since: Instant,
        backoff: bool,
        stop_rx: &mut watch::Receiver<bool>,
        interval_rx: &mut watch::Receiver<Duration>,
    ) -> Wake {
        loop {
            let interval = *interval_rx.borrow_and_update();
            let wait = if backoff { interval * 2 } else { interval };
            tokio::select! {
                _ = tokio::time::sleep_until(since + wait) => return Wake::Elapsed,
                _ = stop_rx.wait_for(|stop| *stop) => return Wake::Stopped,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return Wake::Stopped;
                    }
                }
            }
        }
    }

    async fn run_loop(&self, mut backoff: bool) -> std::result::Result<(), BackendError> {
        let mut stop_rx = self.stop_requested.subscribe();
        let mut interval_rx = self.interval.subscribe();
        let mut last_pass = Instant::now();

        loop {
            match self
                .sleep_until_due(last_pass, backoff, &mut stop_rx, &mut interval_rx)
                .await
            {
                Wake::Stopped => return Ok(()),
                Wake::Elapsed if *stop_rx.borrow() => return Ok(()),
                Wake::Elapsed => {}
            }

            let outcome = self.collect_pass().await;
            last_pass = Instant::now();
            match outcome {
                Ok(_) => backoff = false,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log_error!(self.logger, "Error in monitoring loop: {}", e);
                    backoff = true;
                }
            }
        }
    }

    fn fail(&self, error: BackendError) -> AgentError {
        log_error!(self.logger, "Monitoring loop failed: {}", error);
        self.core.set_state(ServiceState::Error);
        AgentError::service_failed(self.core.name(), error)
    }

    fn health_metrics(&self) -> BTreeMap<String, serde_json::Value> {
        let stats = self.stats();
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "primary_backend".to_string(),
            json!(stats.primary.map(|k| k.as_str())),
        );
        for (kind, available) in &stats.availability {
            metrics.insert(format!("backend.{}", kind), json!(available));
        }
        metrics.insert(
            "last_collection".to_string(),
            json!(stats.last_collection.map(|(_, at)| at.to_rfc3339())),
        );
        metrics.insert("passes".to_string(), json!(stats.passes));
        metrics.insert("failed_passes".to_string(), json!(stats.failed_passes));
        drop(stats);
        metrics.insert(
            "dropped_snapshots".to_string(),
            json!(self.dropped_snapshots()),
        );
        metrics.insert(
            "interval_secs".to_string(),
            json!(self.interval().as_secs_f64()),
        );
        metrics
    }
}

#[async_trait]
impl Service for CollectionService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn start(&self) -> Result<()> {
        if self.state().is_running() || *self.loop_running.borrow() {
            log_debug!(self.logger, "{} already running", self.name());
            return Ok(());
        }

        self.core.set_state(ServiceState::Starting);
        log_info!(
            self.logger,
            "Starting {} (interval: {}s)",
            self.name(),
            self.interval().as_secs_f64()
        );
        self.stop_requested.send_replace(false);
        self.loop_running.send_replace(true);
        let _guard = LoopGuard(&self.loop_running);

        // first pass right away so a consumer need not wait a full interval
        let backoff = match self.collect_pass().await {
            Ok(_) => false,
            Err(e) if e.is_fatal() => return Err(self.fail(e)),
            Err(e) => {
                log_error!(self.logger, "Initial collection failed: {}", e);
                true
            }
        };

        if *self.stop_requested.borrow() {
            return Ok(());
        }
        self.core.set_state(ServiceState::Running);
        self.core.mark_started();
        self.stats().running_since = Some(Instant::now());

        match self.run_loop(backoff).await {
            Ok(()) => {
                log_debug!(self.logger, "{} loop exited", self.name());
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.state().is_stopped() {
            return Ok(());
        }
        self.core.set_state(ServiceState::Stopping);
        log_info!(self.logger, "Stopping {}", self.name());

        self.stop_requested.send_replace(true);
        let mut running = self.loop_running.subscribe();
        if tokio::time::timeout(LOOP_STOP_TIMEOUT, running.wait_for(|r| !*r))
            .await
            .is_err()
        {
            log_warn!(
                self.logger,
                "{} loop did not exit within {:?}",
                self.name(),
                LOOP_STOP_TIMEOUT
            );
        }

        match tokio::time::timeout(LOOP_STOP_TIMEOUT, self.backends.lock()).await {
            Ok(mut backends) => backends.release_all().await,
            Err(_) => log_warn!(
                self.logger,
                "Backends still busy after {:?}, skipping release",
                LOOP_STOP_TIMEOUT
            ),
        }

        {
            let mut stats = self.stats();
            stats.running_since = None;
            stats.primary = None;
            for (_, available) in stats.availability.iter_mut() {
                *available = false;
            }
        }
        self.core.clear_started();
        self.core.set_state(ServiceState::Stopped);
        Ok(())
    }

    async fn check_health(&self) -> ServiceHealth {
        let state = self.state();
        let metrics = self.health_metrics();
        if !state.is_running() {
            return self.core.health(
                false,
                Some(format!("Service not running (current state: {})", state)),
                metrics,
            );
        }

        let limit = self.interval() * STALL_FACTOR;
        let since = {
            let stats = self.stats();
            stats
                .last_collection
                .map(|(at, _)| at)
                .or(stats.running_since)
        };
        if let Some(since) = since {
            let elapsed = since.elapsed();
            if elapsed > limit {
                let reason = format!(
                    "Data collection stalled: no snapshot for {:.1}s (limit {:.1}s)",
                    elapsed.as_secs_f64(),
                    limit.as_secs_f64()
                );
                return self.core.health(false, Some(reason), metrics);
            }
        }

        if !self.core.check_dependencies().await {
            return self.core.health(false, None, metrics);
        }
        self.core.health(true, None, metrics)
    }

    fn attach_queue(&self, queue: SnapshotSender) -> bool {
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
        true
    }
}
