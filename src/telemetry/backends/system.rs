//! Aggregate CPU/memory pseudo-device, used when no GPU is readable.

use super::{BackendError, BackendKind, MetricsBackend};
use crate::log::{Logger, SharedLogger};
use crate::log_trace;
use crate::telemetry::snapshot::{
    CoreMetrics, DeviceKind, DeviceReading, Metric, PlatformDetails, SYSTEM_PSEUDO_DEVICE_MODEL,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant as StdInstant;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};

/// sysinfo handle plus the CPU sampling clock.
///
/// CPU usage is a delta between two refreshes, which sysinfo only computes
/// correctly when they are at least `MINIMUM_CPU_UPDATE_INTERVAL` apart.
/// Wall-clock time is used since that is what sysinfo measures against.
struct HostSampler {
    system: System,
    cpu_refreshed_at: StdInstant,
    cpu_sampled: bool,
}

impl HostSampler {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_components_list();
        Self {
            system,
            cpu_refreshed_at: StdInstant::now(),
            cpu_sampled: false,
        }
    }

    /// Global CPU usage, `Unsupported` until a valid delta exists. Calls
    /// closer together than the minimum interval reuse the last sample.
    fn cpu_usage(&mut self) -> Metric<f64> {
        if self.cpu_refreshed_at.elapsed() >= System::MINIMUM_CPU_UPDATE_INTERVAL {
            self.system.refresh_cpu();
            self.cpu_refreshed_at = StdInstant::now();
            self.cpu_sampled = true;
        }
        if self.cpu_sampled {
            Metric::Value(f64::from(self.system.global_cpu_info().cpu_usage()))
        } else {
            Metric::Unsupported
        }
    }
}

pub struct SystemBackend {
    sampler: Mutex<Option<HostSampler>>,
    logger: SharedLogger,
}

impl SystemBackend {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            sampler: Mutex::new(None),
            logger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HostSampler>> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pseudo-device whose every field failed with `error`.
pub fn unavailable_reading(error: &BackendError) -> DeviceReading {
    let reason = error.to_string();
    DeviceReading {
        id: 0,
        model: SYSTEM_PSEUDO_DEVICE_MODEL.to_string(),
        kind: DeviceKind::SystemAggregate,
        core: CoreMetrics {
            temperature: Metric::Failed(reason.clone()),
            utilization: Metric::Failed(reason.clone()),
            memory_used: Metric::Failed(reason.clone()),
            memory_total: Metric::Failed(reason.clone()),
            power_usage: Metric::Unsupported,
            fan_speed: Metric::Unsupported,
        },
        platform: PlatformDetails::System { cpu_count: 0 },
        extra: BTreeMap::new(),
    }
}

/// Mean temperature of CPU-looking sensors, if any report one.
fn cpu_temperature(system: &System) -> Option<f64> {
    let temps: Vec<f64> = system
        .components()
        .iter()
        .filter(|c| {
            let label = c.label().to_lowercase();
            label.contains("cpu")
                || label.contains("package")
                || label.contains("coretemp")
                || label.contains("k10temp")
                || label.contains("tctl")
        })
        .map(|c| f64::from(c.temperature()))
        .filter(|t| t.is_finite() && *t > 0.0)
        .collect();
    if temps.is_empty() {
        None
    } else {
        Some(temps.iter().sum::<f64>() / temps.len() as f64)
    }
}

#[async_trait]
impl MetricsBackend for SystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    /// Primes the CPU counters and waits out the minimum refresh interval so
    /// the first reading after open carries a real utilization figure.
    async fn open(&self) -> Result<(), BackendError> {
        *self.lock() = Some(HostSampler::new());
        tokio::time::sleep(System::MINIMUM_CPU_UPDATE_INTERVAL).await;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceReading>, BackendError> {
        let mut guard = self.lock();
        let sampler = guard
            .as_mut()
            .ok_or_else(|| BackendError::Unavailable("system backend not opened".into()))?;

        let utilization = sampler.cpu_usage();
        let system = &mut sampler.system;
        system.refresh_memory();
        system.refresh_components();

        let temperature = match cpu_temperature(system) {
            Some(t) => Metric::Value(t),
            None => {
                log_trace!(self.logger, "No CPU temperature sensor found");
                Metric::Unsupported
            }
        };
        let total = system.total_memory();
        let memory_total = if total > 0 {
            Metric::Value(total)
        } else {
            Metric::Unsupported
        };

        Ok(vec![DeviceReading {
            id: 0,
            model: SYSTEM_PSEUDO_DEVICE_MODEL.to_string(),
            kind: DeviceKind::SystemAggregate,
            core: CoreMetrics {
                temperature,
                utilization,
                memory_used: Metric::Value(system.used_memory()),
                memory_total,
                power_usage: Metric::Unsupported,
                fan_speed: Metric::Unsupported,
            },
            platform: PlatformDetails::System {
                cpu_count: system.cpus().len(),
            },
            extra: BTreeMap::new(),
        }])
    }

    async fn release(&self) -> Result<(), BackendError> {
        *self.lock() = None;
        Ok(())
    }

    fn availability(&self) -> bool {
        self.lock().is_some()
    }
}
