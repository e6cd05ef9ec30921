//! Service configuration
//!
//! Layered loading via figment: the YAML file is the base, environment
//! variables prefixed `COLSRV_` override it (nested keys split on `__`,
//! e.g. `COLSRV_SERVICE__LOG_LEVEL=debug`). Validation runs once after
//! extraction; workers are then handed immutable [`DeviceConfig`] values
//! and never re-read configuration at runtime.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::types::{DataPoint, DeviceConfig};
use crate::core::worker::polling::GroupAddress;
use crate::error::{ColSrvError, Result};

/// Service-level settings, independent from any device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Default tracing filter, overridable by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Capacity of the pipeline hand-off channel
    #[serde(default = "default_pipeline_capacity")]
    pub pipeline_capacity: usize,
    /// Heartbeat staleness window for task health checks, in milliseconds
    #[serde(default = "default_health_window_ms")]
    pub health_window_ms: u64,
    /// Interval between status log lines, in seconds (0 disables them)
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

fn default_service_name() -> String {
    "colsrv".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_pipeline_capacity() -> usize {
    1024
}
fn default_health_window_ms() -> u64 {
    10_000
}
fn default_status_interval_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            pipeline_capacity: default_pipeline_capacity(),
            health_window_ms: default_health_window_ms(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn health_window(&self) -> Duration {
        Duration::from_millis(self.health_window_ms)
    }
}

/// One polling group as declared in configuration; `points` refer to point
/// ids declared on the same device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub interval_ms: u64,
    #[serde(default)]
    pub address: GroupAddress,
    pub points: Vec<String>,
}

impl GroupSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One device with its point table and polling groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(flatten)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub points: Vec<DataPoint>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl AppConfig {
    /// Load and validate configuration from a YAML file plus `COLSRV_`
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("COLSRV_").split("__"))
            .extract()
            .map_err(|e| ColSrvError::config(format!("failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces. All errors are
    /// reported against the offending device so operators can find the
    /// line quickly.
    pub fn validate(&self) -> Result<()> {
        let mut device_ids = HashSet::new();
        for spec in &self.devices {
            let device = &spec.device;
            if device.id.is_empty() {
                return Err(ColSrvError::config("device with empty id"));
            }
            if !device_ids.insert(device.id.as_str()) {
                return Err(ColSrvError::config(format!(
                    "duplicate device id: {}",
                    device.id
                )));
            }
            if device.protocol.is_empty() || device.endpoint.is_empty() {
                return Err(ColSrvError::config(format!(
                    "device {}: protocol and endpoint are required",
                    device.id
                )));
            }
            if device.poll_tick_ms == 0 {
                return Err(ColSrvError::config(format!(
                    "device {}: poll_tick_ms must be non-zero",
                    device.id
                )));
            }
            // The poll task heartbeats once per tick; a tick slower than
            // the health window would flag a healthy worker as stalled.
            if device.poll_tick_ms >= self.service.health_window_ms {
                return Err(ColSrvError::config(format!(
                    "device {}: poll_tick_ms ({}) must be below service.health_window_ms ({})",
                    device.id, device.poll_tick_ms, self.service.health_window_ms
                )));
            }

            let mut point_ids = HashSet::new();
            for point in &spec.points {
                if !point_ids.insert(point.id.as_str()) {
                    return Err(ColSrvError::config(format!(
                        "device {}: duplicate point id: {}",
                        device.id, point.id
                    )));
                }
            }

            let mut grouped = HashSet::new();
            for group in &spec.groups {
                if group.interval_ms == 0 {
                    return Err(ColSrvError::config(format!(
                        "device {}: group '{}' has zero interval",
                        device.id, group.name
                    )));
                }
                for point_id in &group.points {
                    if !point_ids.contains(point_id.as_str()) {
                        return Err(ColSrvError::config(format!(
                            "device {}: group '{}' references unknown point: {}",
                            device.id, group.name, point_id
                        )));
                    }
                    if !grouped.insert(point_id.as_str()) {
                        return Err(ColSrvError::config(format!(
                            "device {}: point '{}' appears in more than one group",
                            device.id, point_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Devices that participate in collection.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceSpec> {
        self.devices.iter().filter(|d| d.device.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
service:
  log_level: debug
  pipeline_capacity: 256
devices:
  - id: meter-1
    name: "Main meter"
    protocol: sim
    endpoint: "sim://meter-1"
    poll_tick_ms: 50
    bus: rs485-a
    points:
      - id: voltage
        address: "40001"
        data_type: float32
      - id: current
        address: "40003"
        data_type: float32
    groups:
      - name: electrical
        interval_ms: 1000
        address:
          kind: registers
          register_type: holding
          start: 40001
          count: 4
        points: [voltage, current]
  - id: meter-2
    protocol: sim
    endpoint: "sim://meter-2"
    enabled: false
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample_config() {
        let file = write_config(SAMPLE);
        let config = AppConfig::from_file(file.path()).unwrap();

        assert_eq!(config.service.log_level, "debug");
        assert_eq!(config.service.pipeline_capacity, 256);
        assert_eq!(config.devices.len(), 2);

        let meter = &config.devices[0];
        assert_eq!(meter.device.id, "meter-1");
        assert_eq!(meter.device.bus.as_deref(), Some("rs485-a"));
        assert_eq!(meter.device.poll_tick_ms, 50);
        assert_eq!(meter.points.len(), 2);
        assert_eq!(meter.groups[0].interval(), Duration::from_secs(1));

        // Disabled devices are kept in the document but filtered out
        assert_eq!(config.enabled_devices().count(), 1);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("colsrv.yaml", SAMPLE)?;
            jail.set_env("COLSRV_SERVICE__LOG_LEVEL", "trace");

            let config = AppConfig::from_file("colsrv.yaml").unwrap();
            assert_eq!(config.service.log_level, "trace");
            Ok(())
        });
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let file = write_config(
            r#"
devices:
  - { id: d1, protocol: sim, endpoint: "sim://a" }
  - { id: d1, protocol: sim, endpoint: "sim://b" }
"#,
        );
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate device id"));
    }

    #[test]
    fn test_group_referencing_unknown_point_rejected() {
        let file = write_config(
            r#"
devices:
  - id: d1
    protocol: sim
    endpoint: "sim://a"
    points:
      - { id: p1, address: "1" }
    groups:
      - { name: g1, interval_ms: 100, points: [p1, ghost] }
"#,
        );
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("unknown point"));
    }

    #[test]
    fn test_point_in_two_groups_rejected() {
        let file = write_config(
            r#"
devices:
  - id: d1
    protocol: sim
    endpoint: "sim://a"
    points:
      - { id: p1, address: "1" }
    groups:
      - { name: g1, interval_ms: 100, points: [p1] }
      - { name: g2, interval_ms: 200, points: [p1] }
"#,
        );
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("more than one group"));
    }

    #[test]
    fn test_poll_tick_slower_than_health_window_rejected() {
        let file = write_config(
            r#"
service:
  health_window_ms: 5000
devices:
  - { id: d1, protocol: sim, endpoint: "sim://a", poll_tick_ms: 5000 }
"#,
        );
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("health_window_ms"));
    }

    #[test]
    fn test_defaults_apply() {
        let file = write_config(
            r#"
devices:
  - { id: d1, protocol: sim, endpoint: "sim://a" }
"#,
        );
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "colsrv");
        assert_eq!(config.service.pipeline_capacity, 1024);
        assert!(config.devices[0].device.enabled);
        assert_eq!(config.devices[0].device.max_consecutive_failures, 3);
    }
}
