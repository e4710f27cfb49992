//! macOS graphics via `system_profiler SPDisplaysDataType -json`.
//!
//! Only descriptive fields are available this way; runtime sensors are
//! reported as unsupported. VRAM doubles as `memory_total` when it parses.

use super::{run_command, BackendError, BackendKind, MetricsBackend};
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_trace};
use crate::telemetry::snapshot::{CoreMetrics, DeviceKind, DeviceReading, Metric, PlatformDetails};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

const PROGRAM: &str = "system_profiler";
const ARGS: &[&str] = &["SPDisplaysDataType", "-json"];

#[derive(Debug, Deserialize)]
struct ProfilerReport {
    #[serde(rename = "SPDisplaysDataType", default)]
    displays: Vec<DisplayEntry>,
}

#[derive(Debug, Deserialize)]
struct DisplayEntry {
    #[serde(rename = "_name")]
    name: Option<String>,
    sppci_model: Option<String>,
    spdisplays_vendor: Option<String>,
    spdisplays_vram: Option<String>,
    spdisplays_vram_shared: Option<String>,
    spdisplays_device_id: Option<String>,
    sppci_device_id: Option<String>,
    spdisplays_vendor_id: Option<String>,
    sppci_vendor_id: Option<String>,
    spdisplays_pcislot: Option<String>,
    sppci_bus: Option<String>,
    spdisplays_metal_family: Option<String>,
    spdisplays_mtlgpufamilysupport: Option<String>,
    sppci_cores: Option<String>,
}

/// "8 GB", "1536 MB" -> bytes
pub fn parse_vram(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let amount: u64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.to_ascii_uppercase();
    let scale = match unit.as_str() {
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        _ => return None,
    };
    amount.checked_mul(scale)
}

/// Turn `system_profiler` JSON into device readings.
pub fn parse_displays(json: &[u8]) -> Result<Vec<DeviceReading>, BackendError> {
    let report: ProfilerReport = serde_json::from_slice(json)
        .map_err(|e| BackendError::QueryFailed(format!("invalid system_profiler output: {}", e)))?;

    let devices = report
        .displays
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let model = entry
                .sppci_model
                .clone()
                .or_else(|| entry.name.clone())
                .unwrap_or_else(|| "Unknown GPU".to_string());
            let vram = entry.spdisplays_vram.or(entry.spdisplays_vram_shared);
            let bus = entry.spdisplays_pcislot.or(entry.sppci_bus);
            let vendor = entry.spdisplays_vendor;

            let integrated = bus.as_deref() == Some("spdisplays_builtin")
                || vendor
                    .as_deref()
                    .map(|v| v.contains("Apple") || v.contains("Intel"))
                    .unwrap_or(false);

            let mut extra = BTreeMap::new();
            if let Some(cores) = entry.sppci_cores {
                extra.insert("gpu_cores".to_string(), serde_json::Value::String(cores));
            }

            DeviceReading {
                id: idx as u32,
                model,
                kind: if integrated {
                    DeviceKind::Integrated
                } else {
                    DeviceKind::Discrete
                },
                core: CoreMetrics {
                    memory_total: vram.as_deref().and_then(parse_vram).into(),
                    ..CoreMetrics::unsupported()
                },
                platform: PlatformDetails::SystemProfile {
                    vendor,
                    vram,
                    device_id: entry.spdisplays_device_id.or(entry.sppci_device_id),
                    vendor_id: entry.spdisplays_vendor_id.or(entry.sppci_vendor_id),
                    bus,
                    metal_family: entry
                        .spdisplays_metal_family
                        .or(entry.spdisplays_mtlgpufamilysupport),
                },
                extra,
            }
        })
        .collect();
    Ok(devices)
}

pub struct SystemProfileBackend {
    open: AtomicBool,
    logger: SharedLogger,
}

impl SystemProfileBackend {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            open: AtomicBool::new(false),
            logger,
        }
    }

    async fn query(&self) -> Result<Vec<DeviceReading>, BackendError> {
        let stdout = run_command(BackendKind::SystemProfiler, PROGRAM, ARGS).await?;
        let devices = parse_displays(&stdout)?;
        log_trace!(self.logger, "system_profiler reported {} displays", devices.len());
        Ok(devices)
    }
}

#[async_trait]
impl MetricsBackend for SystemProfileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemProfiler
    }

    async fn open(&self) -> Result<(), BackendError> {
        if !cfg!(target_os = "macos") {
            return Err(BackendError::Unavailable(
                "system_profiler is only available on macOS".into(),
            ));
        }
        let devices = self.query().await?;
        if devices.is_empty() {
            return Err(BackendError::Unavailable(
                "system_profiler reported no displays".into(),
            ));
        }
        log_debug!(self.logger, "system_profiler ready ({} GPUs)", devices.len());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceReading>, BackendError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("system_profiler not opened".into()));
        }
        self.query().await
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn availability(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
