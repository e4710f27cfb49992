//! Hardware telemetry: snapshot model, platform backends, the handoff queue
//! and the collection service that ties them together.

pub mod backends;
pub mod queue;
pub mod service;
pub mod snapshot;

pub use backends::{BackendError, BackendKind, BackendSet, MetricsBackend};
pub use queue::{snapshot_queue, SnapshotReceiver, SnapshotSender};
pub use service::{CollectionService, DEFAULT_INTERVAL, DEFAULT_SERVICE_NAME};
pub use snapshot::{
    CoreMetrics, DeviceKind, DeviceReading, Metric, MetricsSnapshot, PlatformDetails,
    SYSTEM_PSEUDO_DEVICE_MODEL,
};
