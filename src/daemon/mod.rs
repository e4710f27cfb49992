//! Agent daemon - supervisor for long-running services
//!
//! Handles:
//! - Service lifecycle (start, stop, health checks)
//! - Bounded-retry recovery of failed services
//! - Coordinated shutdown on SIGINT/SIGTERM
//!
//! # Architecture
//!
//! One supervisor owns the registry and runs every service as its own tokio
//! task. Services publish into the shared snapshot queue; the supervisor only
//! watches their tasks and never restarts them on its own.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               gpu-agent                   │
//! ├──────────────────────────────────────────┤
//! │ Supervisor │ HealthMonitor │  Shutdown   │
//! │ (tasks)    │ (opt. recover)│  (signals)  │
//! ├──────────────────────────────────────────┤
//! │ gpu_monitor │ ...                         │
//! └──────────────────────────────────────────┘
//! ```

pub mod health;
pub mod recovery;
pub mod service;
pub mod shutdown;
pub mod supervisor;

pub use health::{HealthMonitor, HealthStatus};
pub use recovery::{recover, BackoffPolicy, Recovery, RecoveryPolicy};
pub use service::{Service, ServiceCore, ServiceHealth, ServiceState};
pub use shutdown::{ShutdownCoordinator, ShutdownHandle};
pub use supervisor::{DaemonSupervisor, ServiceInfo, SupervisorOptions};
