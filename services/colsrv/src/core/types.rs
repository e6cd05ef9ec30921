//! Core data types shared across the collection engine
//!
//! Defines the value model (`DataValue`, `TimestampedValue`), the device and
//! point configuration types supplied by the configuration source, and the
//! state enumerations for workers and driver connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A single field value read from or written to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl DataValue {
    /// Best-effort numeric view, used for statistics and logging.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            DataValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataValue::Bool(b) => write!(f, "{}", b),
            DataValue::Int(i) => write!(f, "{}", i),
            DataValue::Float(v) => write!(f, "{}", v),
            DataValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Quality flag attached to each collected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

/// A collected value as forwarded to the downstream pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedValue {
    /// Point id this value belongs to
    pub point_id: String,
    /// The value itself
    pub value: DataValue,
    /// Quality of the reading
    pub quality: Quality,
    /// Acquisition timestamp
    pub timestamp: DateTime<Utc>,
    /// Per-worker monotonically increasing sequence number
    pub sequence: u32,
}

impl TimestampedValue {
    pub fn new(point_id: impl Into<String>, value: DataValue) -> Self {
        Self {
            point_id: point_id.into(),
            value,
            quality: Quality::Good,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }
}

/// Declared type of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Bool,
    Int16,
    Int32,
    #[default]
    Float32,
    Float64,
    Text,
}

/// A configured data point. Read-only to the worker; owned by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    /// Stable point id, unique within a device
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Protocol-specific address (register number, topic, object id, ...)
    pub address: String,
    /// Declared type
    #[serde(default)]
    pub data_type: PointType,
    /// Optional protocol parameters (byte order, scaling, ...)
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Immutable device identity and tuning supplied at worker construction.
///
/// Changing any of these requires recreating the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device id
    pub id: String,
    /// Human-readable device name
    #[serde(default)]
    pub name: String,
    /// Protocol name resolved through the driver registry
    pub protocol: String,
    /// Endpoint string (host:port, serial device path, broker URL, ...)
    pub endpoint: String,
    /// Whether the device participates in collection
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scheduler tick for the polling loop, in milliseconds
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,
    /// I/O timeout per protocol operation, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive read/keep-alive failures that trigger reconnection
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Keep-alive probe interval, in milliseconds (0 disables the probe)
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_interval_ms: u64,
    /// Upper bound for the reconnect backoff, in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Bounded wait applied when stopping the worker's tasks, in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Name of the shared physical bus, if any (workers with the same bus
    /// name are serialized against each other)
    #[serde(default)]
    pub bus: Option<String>,
    /// Free-form protocol properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}
fn default_poll_tick_ms() -> u64 {
    100
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_keep_alive_ms() -> u64 {
    30_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}
fn default_stop_timeout_ms() -> u64 {
    5000
}

impl DeviceConfig {
    /// Minimal config for tests and simulated devices.
    pub fn new(id: impl Into<String>, protocol: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            protocol: protocol.into(),
            endpoint: endpoint.into(),
            enabled: true,
            poll_tick_ms: default_poll_tick_ms(),
            timeout_ms: default_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            keep_alive_interval_ms: default_keep_alive_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            bus: None,
            properties: HashMap::new(),
        }
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Connection lifecycle state of a device worker.
///
/// Distinct from the driver's [`ConnectionStatus`]: the driver reports wire
/// status, the worker derives its own state from status transitions plus its
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Paused,
    Reconnecting,
    Error,
}

impl WorkerState {
    /// Whether the worker holds (or is re-establishing) a session.
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Paused | WorkerState::Reconnecting
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Paused => "Paused",
            WorkerState::Reconnecting => "Reconnecting",
            WorkerState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// Wire-level connection status reported by a protocol driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_value_as_f64() {
        assert_eq!(DataValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(DataValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(DataValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(DataValue::Text("x".into()).as_f64(), None);
    }

    #[test]
    fn test_device_config_defaults() {
        let yaml = r#"
id: dev-1
protocol: sim
endpoint: "sim://local"
"#;
        let cfg: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.poll_tick_ms, 100);
        assert_eq!(cfg.max_consecutive_failures, 3);
        assert_eq!(cfg.keep_alive_interval_ms, 30_000);
        assert!(cfg.bus.is_none());
    }

    #[test]
    fn test_worker_state_active() {
        assert!(WorkerState::Running.is_active());
        assert!(WorkerState::Reconnecting.is_active());
        assert!(!WorkerState::Stopped.is_active());
        assert!(!WorkerState::Error.is_active());
    }

    #[test]
    fn test_connection_status_serde() {
        let json = serde_json::to_string(&ConnectionStatus::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }
}
