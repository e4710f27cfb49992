use anyhow::Context;
use gpu_agent::daemon::{DaemonSupervisor, HealthMonitor, Service};
use gpu_agent::logging::{init_logging, LogLevelHandle};
use gpu_agent::telemetry::{snapshot_queue, CollectionService, SnapshotReceiver, DEFAULT_SERVICE_NAME};
use gpu_agent::{log, AgentConfig};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Command-line values that win over the config file, including after a reload.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOverrides {
    pub interval: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub log_level: Option<String>,
}

impl RunOverrides {
    fn apply(&self, mut config: AgentConfig) -> anyhow::Result<AgentConfig> {
        if let Some(interval) = self.interval {
            config.monitoring_interval_secs = interval;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_config(overrides: &RunOverrides) -> anyhow::Result<AgentConfig> {
    let path = AgentConfig::config_path();
    let config = AgentConfig::load()
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    overrides.apply(config)
}

pub(crate) async fn cmd_run(overrides: RunOverrides) -> anyhow::Result<()> {
    let config = load_config(&overrides)?;
    let log_handle = init_logging(&config.log_level).context("Failed to initialise logging")?;
    if log_handle.is_env_pinned() {
        tracing::debug!("Log filter taken from RUST_LOG, log_level from config is ignored");
    }

    tracing::info!(
        interval_secs = config.monitoring_interval_secs,
        queue_capacity = config.queue_capacity,
        "Running gpu-agent in foreground (Ctrl+C to stop)"
    );

    let logger = log::tracing_logger();
    let (queue, receiver) = snapshot_queue(config.queue_capacity, logger.clone());
    let supervisor = Arc::new(DaemonSupervisor::new(
        config.supervisor_options(),
        queue,
        logger.clone(),
    ));

    let collector = Arc::new(
        CollectionService::new(
            DEFAULT_SERVICE_NAME,
            config.monitoring_interval(),
            logger.clone(),
        )
        .with_recovery_policy(config.recovery_policy()),
    );
    supervisor
        .register_service(collector.clone())
        .await
        .context("Failed to register collection service")?;

    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = spawn_consumer(
        receiver,
        Duration::from_millis(config.consumer_poll_ms),
        Arc::clone(&consumer_stop),
    )
    .context("Failed to start snapshot consumer")?;

    let monitor = config.auto_recover.then(|| {
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), logger.clone())
            .with_interval(Duration::from_secs(config.supervisor_poll_secs));
        tokio::spawn(async move { monitor.run().await })
    });

    let reload = spawn_reload(overrides, Arc::clone(&collector), log_handle);

    let result = supervisor.start().await;

    if let Some(task) = monitor {
        task.abort();
    }
    if let Some(task) = reload {
        task.abort();
    }
    consumer_stop.store(true, Ordering::SeqCst);
    match tokio::task::spawn_blocking(move || consumer.join()).await {
        Ok(Ok(())) => {}
        _ => tracing::warn!("Snapshot consumer did not exit cleanly"),
    }

    tracing::info!(
        service = collector.name(),
        state = %collector.state(),
        "gpu-agent stopped"
    );
    result.context("Daemon stopped with an error")
}

/// Stand-in for the UI: drain the queue on its own cadence and print each
/// snapshot as one JSON line.
fn spawn_consumer(
    mut receiver: SnapshotReceiver,
    poll: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("snapshot-consumer".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            while !stop.load(Ordering::SeqCst) {
                for snapshot in receiver.drain() {
                    let line = match serde_json::to_string(&snapshot) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to serialise snapshot");
                            continue;
                        }
                    };
                    let mut out = stdout.lock();
                    if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                        // stdout closed (e.g. `| head`), nothing left to do
                        return;
                    }
                }
                std::thread::sleep(poll);
            }
        })
}

/// Re-read the config file on SIGHUP and apply interval and log level.
#[cfg(unix)]
fn spawn_reload(
    overrides: RunOverrides,
    collector: Arc<CollectionService>,
    log_handle: LogLevelHandle,
) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Could not install SIGHUP handler, reload disabled");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading configuration");
            let config = match load_config(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "Reload failed, keeping current settings");
                    continue;
                }
            };
            collector.set_interval(config.monitoring_interval());
            match log_handle.apply_configured_level(&config.log_level) {
                Ok(true) => {}
                Ok(false) => tracing::info!(
                    configured = %config.log_level,
                    "RUST_LOG is set, keeping its filter over the configured log level"
                ),
                Err(e) => tracing::error!(error = %e, "Failed to apply log level"),
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload(
    _overrides: RunOverrides,
    _collector: Arc<CollectionService>,
    _log_handle: LogLevelHandle,
) -> Option<tokio::task::JoinHandle<()>> {
    None
}
