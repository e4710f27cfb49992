//! NVIDIA devices via NVML.
//!
//! Each field is queried independently so one unsupported sensor (fans on
//! passively cooled cards, power on some laptops) does not hide the rest.
//! NVML calls block, so every call runs on the blocking pool.

use super::{BackendError, BackendKind, MetricsBackend};
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_info, log_trace};
use crate::telemetry::snapshot::{CoreMetrics, DeviceKind, DeviceReading, Metric, PlatformDetails};
use async_trait::async_trait;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Devices beyond this index are ignored.
const MAX_DEVICES: u32 = 16;

pub struct NvmlBackend {
    nvml: Arc<Mutex<Option<Nvml>>>,
    logger: SharedLogger,
}

impl NvmlBackend {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            nvml: Arc::new(Mutex::new(None)),
            logger,
        }
    }

    fn lock(handle: &Mutex<Option<Nvml>>) -> MutexGuard<'_, Option<Nvml>> {
        handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Mutex<Option<Nvml>>) -> Result<T, BackendError> + Send + 'static,
    {
        let handle = Arc::clone(&self.nvml);
        tokio::task::spawn_blocking(move || f(&handle))
            .await
            .map_err(|e| BackendError::QueryFailed(format!("NVML worker failed: {}", e)))?
    }
}

/// Map one field query, keeping "not supported" apart from real failures.
fn field<T>(logger: &SharedLogger, device: u32, name: &str, result: Result<T, NvmlError>) -> Metric<T> {
    match result {
        Ok(value) => Metric::Value(value),
        Err(NvmlError::NotSupported) => {
            log_trace!(logger, "GPU {}: {} not supported", device, name);
            Metric::Unsupported
        }
        Err(e) => {
            log_debug!(logger, "GPU {}: {} query failed: {}", device, name, e);
            Metric::Failed(e.to_string())
        }
    }
}

fn classify(e: NvmlError) -> BackendError {
    match e {
        NvmlError::GpuLost => BackendError::Fatal(e.to_string()),
        NvmlError::Uninitialized | NvmlError::DriverNotLoaded | NvmlError::LibloadingError(_) => {
            BackendError::Unavailable(e.to_string())
        }
        other => BackendError::QueryFailed(other.to_string()),
    }
}

fn read_devices(nvml: &Nvml, logger: &SharedLogger) -> Result<Vec<DeviceReading>, BackendError> {
    let count = nvml.device_count().map_err(classify)?;
    let driver_version = nvml.sys_driver_version().ok();

    let mut devices = Vec::with_capacity(count.min(MAX_DEVICES) as usize);
    for i in 0..count.min(MAX_DEVICES) {
        let device = nvml.device_by_index(i).map_err(classify)?;

        let model = device
            .name()
            .unwrap_or_else(|_| "Unknown NVIDIA GPU".to_string());
        let memory = device.memory_info();
        let (memory_used, memory_total) = match memory {
            Ok(m) => (Metric::Value(m.used), Metric::Value(m.total)),
            Err(e) => {
                let m = field::<u64>(logger, i, "memory", Err(e));
                (m.clone(), m)
            }
        };

        devices.push(DeviceReading {
            id: i,
            model,
            kind: DeviceKind::Discrete,
            core: CoreMetrics {
                temperature: field(
                    logger,
                    i,
                    "temperature",
                    device.temperature(TemperatureSensor::Gpu),
                )
                .map(f64::from),
                utilization: field(logger, i, "utilization", device.utilization_rates())
                    .map(|u| f64::from(u.gpu)),
                memory_used,
                memory_total,
                // milliwatts
                power_usage: field(logger, i, "power", device.power_usage())
                    .map(|mw| f64::from(mw) / 1000.0),
                fan_speed: field(logger, i, "fan speed", device.fan_speed(0)),
            },
            platform: PlatformDetails::Nvidia {
                uuid: device.uuid().ok(),
                driver_version: driver_version.clone(),
            },
            extra: BTreeMap::new(),
        });
    }
    Ok(devices)
}

#[async_trait]
impl MetricsBackend for NvmlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nvml
    }

    async fn open(&self) -> Result<(), BackendError> {
        let logger = Arc::clone(&self.logger);
        self.blocking(move |handle| {
            let mut guard = NvmlBackend::lock(handle);
            if guard.is_some() {
                return Ok(());
            }
            let nvml = Nvml::init().map_err(|e| BackendError::Unavailable(e.to_string()))?;
            let count = nvml.device_count().unwrap_or(0);
            log_info!(logger, "NVML initialized ({} devices)", count);
            *guard = Some(nvml);
            Ok(())
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceReading>, BackendError> {
        let logger = Arc::clone(&self.logger);
        self.blocking(move |handle| {
            let guard = NvmlBackend::lock(handle);
            let nvml = guard
                .as_ref()
                .ok_or_else(|| BackendError::Unavailable("NVML not initialized".into()))?;
            read_devices(nvml, &logger)
        })
        .await
    }

    async fn release(&self) -> Result<(), BackendError> {
        let logger = Arc::clone(&self.logger);
        self.blocking(move |handle| {
            let Some(nvml) = NvmlBackend::lock(handle).take() else {
                return Ok(());
            };
            nvml.shutdown()
                .map_err(|e| BackendError::QueryFailed(format!("NVML shutdown failed: {}", e)))?;
            log_info!(logger, "NVML shutdown complete");
            Ok(())
        })
        .await
    }

    fn availability(&self) -> bool {
        NvmlBackend::lock(&self.nvml).is_some()
    }
}
