//! Windows video controllers via CIM (`Win32_VideoController`).

use super::{run_command, BackendError, BackendKind, MetricsBackend};
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_trace};
use crate::telemetry::snapshot::{CoreMetrics, DeviceKind, DeviceReading, PlatformDetails};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

const PROGRAM: &str = "powershell";
const QUERY: &str = "Get-CimInstance Win32_VideoController | \
    Select-Object Name,AdapterRAM,DriverVersion,VideoProcessor,PNPDeviceID,\
    CurrentHorizontalResolution,CurrentVerticalResolution,CurrentRefreshRate | \
    ConvertTo-Json -Compress";

/// `ConvertTo-Json` emits a bare object for a single controller.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<VideoController>),
    One(VideoController),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VideoController {
    name: Option<String>,
    #[serde(rename = "AdapterRAM")]
    adapter_ram: Option<u64>,
    driver_version: Option<String>,
    video_processor: Option<String>,
    #[serde(rename = "PNPDeviceID")]
    pnp_device_id: Option<String>,
    current_horizontal_resolution: Option<u32>,
    current_vertical_resolution: Option<u32>,
    current_refresh_rate: Option<u32>,
}

fn is_integrated(model: &str) -> bool {
    let model = model.to_lowercase();
    (model.contains("intel") && !model.contains("arc"))
        || model.contains("radeon(tm) graphics")
        || model.contains("basic display")
}

/// Turn `ConvertTo-Json` output into device readings.
pub fn parse_controllers(json: &[u8]) -> Result<Vec<DeviceReading>, BackendError> {
    let text = String::from_utf8_lossy(json);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany = serde_json::from_str(text.trim())
        .map_err(|e| BackendError::QueryFailed(format!("invalid CIM output: {}", e)))?;
    let controllers = match parsed {
        OneOrMany::Many(list) => list,
        OneOrMany::One(one) => vec![one],
    };

    let devices = controllers
        .into_iter()
        .enumerate()
        .map(|(idx, c)| {
            let model = c.name.unwrap_or_else(|| "Unknown GPU".to_string());
            let resolution = match (c.current_horizontal_resolution, c.current_vertical_resolution) {
                (Some(h), Some(v)) => Some(format!("{}x{}", h, v)),
                _ => None,
            };
            // AdapterRAM is a uint32 in WMI; 0 means unknown
            let adapter_ram = c.adapter_ram.filter(|ram| *ram > 0);

            let mut extra = BTreeMap::new();
            if let Some(pnp) = c.pnp_device_id {
                extra.insert("pnp_device_id".to_string(), serde_json::Value::String(pnp));
            }

            DeviceReading {
                id: idx as u32,
                kind: if is_integrated(&model) {
                    DeviceKind::Integrated
                } else {
                    DeviceKind::Discrete
                },
                model,
                core: CoreMetrics {
                    memory_total: adapter_ram.into(),
                    ..CoreMetrics::unsupported()
                },
                platform: PlatformDetails::Cim {
                    driver_version: c.driver_version,
                    video_processor: c.video_processor,
                    adapter_ram,
                    resolution,
                    refresh_rate: c.current_refresh_rate,
                },
                extra,
            }
        })
        .collect();
    Ok(devices)
}

pub struct CimBackend {
    open: AtomicBool,
    logger: SharedLogger,
}

impl CimBackend {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            open: AtomicBool::new(false),
            logger,
        }
    }

    async fn query(&self) -> Result<Vec<DeviceReading>, BackendError> {
        let stdout =
            run_command(BackendKind::Cim, PROGRAM, &["-NoProfile", "-Command", QUERY]).await?;
        let devices = parse_controllers(&stdout)?;
        log_trace!(self.logger, "CIM reported {} video controllers", devices.len());
        Ok(devices)
    }
}

#[async_trait]
impl MetricsBackend for CimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cim
    }

    async fn open(&self) -> Result<(), BackendError> {
        if !cfg!(target_os = "windows") {
            return Err(BackendError::Unavailable(
                "CIM is only available on Windows".into(),
            ));
        }
        let devices = self.query().await?;
        if devices.is_empty() {
            return Err(BackendError::Unavailable(
                "no Win32_VideoController instances".into(),
            ));
        }
        log_debug!(self.logger, "CIM ready ({} video controllers)", devices.len());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceReading>, BackendError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("CIM not opened".into()));
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
