//! Collection Service Library (colsrv)
//!
//! An async-first data-collection gateway engine for industrial devices.
//! Each configured device gets one [`DeviceWorker`] owning a protocol
//! driver, a polling schedule, and a small set of managed tasks; collected
//! values flow fire-and-forget into a [`PipelineSink`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │  AppConfig   │───►│ DriverRegistry  │───►│  DeviceWorker(s) │
//! │   (YAML)     │    │ (per protocol)  │    │ poll/reconnect/  │
//! └──────────────┘    └─────────────────┘    │     events       │
//!                                            └────────┬─────────┘
//!                                                     ▼
//!                                            ┌──────────────────┐
//!                                            │   PipelineSink   │
//!                                            └──────────────────┘
//! ```
//!
//! Workers sharing a physical medium (an RS-485 bus) coordinate through a
//! [`BusLock`] so their reads never interleave on the wire.
//!
//! # Quick Start
//!
//! ```no_run
//! use colsrv::{AppConfig, DeviceWorker, DriverRegistry, NullSink, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AppConfig::from_file("config/colsrv.yaml")?;
//!     let registry = DriverRegistry::with_builtin();
//!
//!     for spec in config.enabled_devices() {
//!         let driver = registry.create(&spec.device.protocol)?;
//!         let worker = DeviceWorker::new(
//!             spec.device.clone(),
//!             spec.points.clone(),
//!             driver,
//!             Arc::new(NullSink),
//!             None,
//!         );
//!         worker.start().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;

pub use crate::core::config::{AppConfig, DeviceSpec, GroupSpec, ServiceConfig};
pub use crate::core::driver::{
    DriverConfig, DriverEvent, DriverRegistry, DriverStatistics, DriverStatsSnapshot,
    ProtocolDriver,
};
pub use crate::core::pipeline::{ChannelSink, CollectingSink, NullSink, PipelineSink};
pub use crate::core::tasks::{LoopStep, TaskContext, TaskLifecycleManager, TaskState};
pub use crate::core::types::{
    ConnectionStatus, DataPoint, DataValue, DeviceConfig, PointType, Quality, TimestampedValue,
    WorkerState,
};
pub use crate::core::worker::polling::{new_bus_lock, BusLock, GroupAddress};
pub use crate::core::worker::reconnect::ReconnectPolicy;
pub use crate::core::worker::DeviceWorker;
pub use crate::error::{ColSrvError, Result};
