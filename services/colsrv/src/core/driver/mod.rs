//! Protocol driver contract
//!
//! Every protocol implementation (Modbus, BACnet, MQTT, HTTP, ...) sits
//! behind the [`ProtocolDriver`] trait. Drivers know nothing about device
//! identity or worker bookkeeping: they report their own wire status through
//! a bounded event channel handed over at [`ProtocolDriver::initialize`],
//! and the owning worker tags those events with the device on receipt.
//!
//! A driver instance is never called concurrently: the worker serializes
//! connect/read/write access behind its own driver mutex (and the bus lock
//! where a physical medium is shared).

pub mod mock;
pub mod stats;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::types::{ConnectionStatus, DataPoint, DataValue, TimestampedValue};
use crate::error::{ColSrvError, Result};

pub use stats::{DriverStatistics, DriverStatsSnapshot, METRIC_AVG_RESPONSE_TIME_MS};

/// Capacity of the per-driver event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Configuration handed to a driver at initialization, derived from the
/// owning device's [`crate::core::types::DeviceConfig`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Endpoint string (host:port, serial path, broker URL, ...)
    pub endpoint: String,
    /// Per-operation I/O timeout
    pub timeout: Duration,
    /// Free-form protocol properties
    pub properties: HashMap<String, String>,
}

/// Status and fault notifications emitted by a driver.
///
/// Deliberately free of device identity: the worker owning the driver adds
/// that context when it consumes the event.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The wire status changed
    StatusChanged(ConnectionStatus),
    /// A driver-internal fault worth surfacing (not tied to one operation)
    Fault(String),
}

/// Sending side of a driver's event channel.
pub type DriverEventTx = mpsc::Sender<DriverEvent>;

/// Receiving side, held by the owning worker.
pub type DriverEventRx = mpsc::Receiver<DriverEvent>;

/// Create the bounded event channel connecting a driver to its worker.
pub fn event_channel() -> (DriverEventTx, DriverEventRx) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Uniform capability surface of a protocol implementation.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Protocol name, matching the registry key ("modbus-tcp", "mqtt", ...)
    fn protocol_name(&self) -> &str;

    /// Validate configuration and bind the event channel. Called by the
    /// owning worker on every start, before `connect`.
    async fn initialize(&mut self, config: DriverConfig, events: DriverEventTx) -> Result<()>;

    /// Establish the physical/logical connection.
    async fn connect(&mut self) -> Result<()>;

    /// Tear the connection down. Must be idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Cheap, non-blocking wire status query.
    fn is_connected(&self) -> bool;

    /// Current wire status.
    fn status(&self) -> ConnectionStatus;

    /// One batched read of the given points.
    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<TimestampedValue>>;

    /// One single-point write. No retry at this layer.
    async fn write_value(&mut self, point: &DataPoint, value: DataValue) -> Result<()>;

    /// Lightweight link-liveness probe, distinct from a data read.
    ///
    /// The default implementation only checks the cached wire status;
    /// protocols with a real echo/identity request should override it.
    async fn keep_alive(&mut self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ColSrvError::connection("keep-alive: link down"))
        }
    }

    /// Shared statistics handle. Updated by the driver on every attempt.
    fn statistics(&self) -> Arc<DriverStatistics>;

    /// Most recent error message, if any.
    fn last_error(&self) -> Option<String>;
}

/// Constructor closure stored in the registry.
pub type DriverCtor = Box<dyn Fn() -> Box<dyn ProtocolDriver> + Send + Sync>;

/// Registry mapping protocol names to driver constructors.
///
/// Workers receive their driver instance by injection; nothing in the engine
/// reaches into process-wide state to obtain one.
#[derive(Default)]
pub struct DriverRegistry {
    ctors: HashMap<String, DriverCtor>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in simulated driver, used by the binary when
    /// no real protocol stack is linked in.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sim", || Box::new(mock::MockDriver::new("sim")));
        registry
    }

    /// Register a constructor. Returns false if the protocol name is taken.
    pub fn register<F>(&mut self, protocol: impl Into<String>, ctor: F) -> bool
    where
        F: Fn() -> Box<dyn ProtocolDriver> + Send + Sync + 'static,
    {
        let protocol = protocol.into();
        if self.ctors.contains_key(&protocol) {
            return false;
        }
        self.ctors.insert(protocol, Box::new(ctor));
        true
    }

    /// Create a fresh driver instance for the given protocol.
    pub fn create(&self, protocol: &str) -> Result<Box<dyn ProtocolDriver>> {
        self.ctors
            .get(protocol)
            .map(|ctor| ctor())
            .ok_or_else(|| ColSrvError::config(format!("unknown protocol: {}", protocol)))
    }

    /// Registered protocol names.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_create() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register("sim", || Box::new(mock::MockDriver::new("sim"))));
        assert!(!registry.register("sim", || Box::new(mock::MockDriver::new("sim"))));

        let driver = registry.create("sim").unwrap();
        assert_eq!(driver.protocol_name(), "sim");
        assert!(registry.create("dnp3").is_err());
    }

    #[test]
    fn test_builtin_registry() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.protocols(), vec!["sim".to_string()]);
    }
}
