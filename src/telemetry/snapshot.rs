//! Snapshot data model handed from the collector to its consumer.

use super::backends::BackendKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model name of the aggregate CPU/memory pseudo-device.
pub const SYSTEM_PSEUDO_DEVICE_MODEL: &str = "System (CPU/Memory)";

/// One metric field. Unavailable fields are never reported as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Metric<T> {
    Value(T),
    /// Not queryable on this device or platform
    Unsupported,
    /// The query was attempted and failed
    Failed(String),
}

impl<T> Metric<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Metric::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Metric::Value(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Metric<U> {
        match self {
            Metric::Value(v) => Metric::Value(f(v)),
            Metric::Unsupported => Metric::Unsupported,
            Metric::Failed(e) => Metric::Failed(e),
        }
    }
}

impl<T> From<Option<T>> for Metric<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Metric::Value(v),
            None => Metric::Unsupported,
        }
    }
}

/// Fields every backend tries to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreMetrics {
    /// Degrees Celsius
    pub temperature: Metric<f64>,
    /// Percent, 0-100
    pub utilization: Metric<f64>,
    /// Bytes
    pub memory_used: Metric<u64>,
    /// Bytes
    pub memory_total: Metric<u64>,
    /// Watts
    pub power_usage: Metric<f64>,
    /// Percent of max fan speed
    pub fan_speed: Metric<u32>,
}

impl CoreMetrics {
    pub fn unsupported() -> Self {
        Self {
            temperature: Metric::Unsupported,
            utilization: Metric::Unsupported,
            memory_used: Metric::Unsupported,
            memory_total: Metric::Unsupported,
            power_usage: Metric::Unsupported,
            fan_speed: Metric::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Discrete,
    Integrated,
    /// CPU/memory stand-in when no GPU is readable
    SystemAggregate,
}

/// Platform-specific descriptive fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum PlatformDetails {
    Nvidia {
        uuid: Option<String>,
        driver_version: Option<String>,
    },
    /// macOS `system_profiler`
    SystemProfile {
        vendor: Option<String>,
        vram: Option<String>,
        device_id: Option<String>,
        vendor_id: Option<String>,
        bus: Option<String>,
        metal_family: Option<String>,
    },
    /// Windows CIM / WMI
    Cim {
        driver_version: Option<String>,
        video_processor: Option<String>,
        adapter_ram: Option<u64>,
        resolution: Option<String>,
        refresh_rate: Option<u32>,
    },
    System {
        cpu_count: usize,
    },
}

/// One device entry of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub id: u32,
    pub model: String,
    pub kind: DeviceKind,
    pub core: CoreMetrics,
    pub platform: PlatformDetails,
    /// Fields without a typed home yet
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DeviceReading {
    pub fn is_pseudo_device(&self) -> bool {
        self.kind == DeviceKind::SystemAggregate
    }
}

/// Immutable point-in-time bundle of device readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Per-service pass counter, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: BackendKind,
    pub device_count: usize,
    /// Real devices only; the aggregate pseudo-device is excluded
    pub active_device_count: usize,
    pub devices: Vec<DeviceReading>,
}

impl MetricsSnapshot {
    pub fn new(sequence: u64, source: BackendKind, devices: Vec<DeviceReading>) -> Self {
        let active_device_count = devices.iter().filter(|d| !d.is_pseudo_device()).count();
        Self {
            sequence,
            timestamp: Utc::now(),
            source,
            device_count: devices.len(),
            active_device_count,
            devices,
        }
    }

    pub fn is_fallback(&self) -> bool {
        !self.devices.is_empty() && self.active_device_count == 0
    }
}
