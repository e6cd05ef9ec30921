//! Mock protocol driver
//!
//! A scriptable in-memory driver used two ways: as the built-in `sim`
//! protocol for running the service without field hardware, and as the
//! instrumented test double for the worker/scheduler test suites. Failure
//! injection and call accounting are controlled through a [`MockDriverHandle`]
//! that stays valid after the driver is boxed and handed to a worker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DriverConfig, DriverEvent, DriverEventTx, DriverStatistics, ProtocolDriver};
use crate::core::types::{ConnectionStatus, DataPoint, DataValue, Quality, TimestampedValue};
use crate::error::{ColSrvError, Result};

#[derive(Debug, Default)]
struct MockState {
    connected: AtomicBool,
    /// Simulates a silently dead link: the driver still believes itself
    /// connected until asked, then reports down.
    link_down: AtomicBool,
    fail_connects_remaining: AtomicU32,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Fail every other keep-alive probe (odd calls), never two in a row.
    fail_alternate_keep_alives: AtomicBool,
    panic_reads: AtomicBool,
    connect_attempts: AtomicU32,
    read_calls: AtomicU32,
    write_calls: AtomicU32,
    keep_alive_calls: AtomicU32,
    read_delay_ms: AtomicU64,
    counter: AtomicU64,
    read_spans: Mutex<Vec<(Instant, Instant)>>,
    last_error: Mutex<Option<String>>,
    event_tx: Mutex<Option<DriverEventTx>>,
}

/// Control/introspection handle for a [`MockDriver`].
#[derive(Clone)]
pub struct MockDriverHandle {
    state: Arc<MockState>,
}

impl MockDriverHandle {
    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects_remaining.store(n, Ordering::SeqCst);
    }

    /// Make every read fail (connection stays up).
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail keep-alive probes in a strict fail/success alternation while
    /// the connection stays up, to exercise intermittent probe loss.
    pub fn set_alternate_keep_alive_failures(&self, fail: bool) {
        self.state.fail_alternate_keep_alives.store(fail, Ordering::SeqCst);
    }

    /// Make every read panic instead of returning, to exercise fault
    /// containment in the owning worker.
    pub fn set_panic_reads(&self, panic: bool) {
        self.state.panic_reads.store(panic, Ordering::SeqCst);
    }

    /// Simulate a silent disconnect: `is_connected()` reports false until
    /// the next successful connect.
    pub fn set_link_down(&self, down: bool) {
        self.state.link_down.store(down, Ordering::SeqCst);
    }

    /// Artificial latency inside each read, to make overlap observable.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Push a fault event through the driver's event channel, as a driver
    /// with an internal watchdog would.
    pub fn emit_fault(&self, message: impl Into<String>) {
        if let Some(tx) = self.state.event_tx.lock().clone() {
            let _ = tx.try_send(DriverEvent::Fault(message.into()));
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u32 {
        self.state.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> u32 {
        self.state.write_calls.load(Ordering::SeqCst)
    }

    pub fn keep_alive_calls(&self) -> u32 {
        self.state.keep_alive_calls.load(Ordering::SeqCst)
    }

    /// Start/end instants of every read call, for bus-exclusion checks.
    pub fn read_spans(&self) -> Vec<(Instant, Instant)> {
        self.state.read_spans.lock().clone()
    }
}

/// In-memory driver producing a monotonically increasing value per point.
pub struct MockDriver {
    protocol: String,
    state: Arc<MockState>,
    stats: Arc<DriverStatistics>,
}

impl MockDriver {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            state: Arc::new(MockState::default()),
            stats: Arc::new(DriverStatistics::new()),
        }
    }

    /// Obtain the control handle before boxing the driver.
    pub fn handle(&self) -> MockDriverHandle {
        MockDriverHandle {
            state: self.state.clone(),
        }
    }

    fn set_last_error(&self, msg: impl Into<String>) {
        *self.state.last_error.lock() = Some(msg.into());
    }

    fn send_event(&self, event: DriverEvent) {
        if let Some(tx) = self.state.event_tx.lock().clone() {
            let _ = tx.try_send(event);
        }
    }
}

#[async_trait]
impl ProtocolDriver for MockDriver {
    fn protocol_name(&self) -> &str {
        &self.protocol
    }

    async fn initialize(&mut self, config: DriverConfig, events: DriverEventTx) -> Result<()> {
        if config.endpoint.is_empty() {
            return Err(ColSrvError::config("mock driver: empty endpoint"));
        }
        *self.state.event_tx.lock() = Some(events);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.fail_connects_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects_remaining.store(remaining - 1, Ordering::SeqCst);
            self.stats.record_connection_result(false);
            self.set_last_error("simulated connect failure");
            return Err(ColSrvError::connection("simulated connect failure"));
        }

        self.state.connected.store(true, Ordering::SeqCst);
        self.state.link_down.store(false, Ordering::SeqCst);
        self.stats.record_connection_result(true);
        self.send_event(DriverEvent::StatusChanged(ConnectionStatus::Connected));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state.connected.swap(false, Ordering::SeqCst) {
            self.send_event(DriverEvent::StatusChanged(ConnectionStatus::Disconnected));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst) && !self.state.link_down.load(Ordering::SeqCst)
    }

    fn status(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<TimestampedValue>> {
        self.state.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.panic_reads.load(Ordering::SeqCst) {
            panic!("simulated read panic");
        }
        let started = Instant::now();

        let delay = self.state.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = if !self.is_connected() {
            self.set_last_error("read while disconnected");
            Err(ColSrvError::connection("read while disconnected"))
        } else if self.state.fail_reads.load(Ordering::SeqCst) {
            self.set_last_error("simulated read failure");
            Err(ColSrvError::protocol("simulated read failure"))
        } else {
            let base = self.state.counter.fetch_add(1, Ordering::SeqCst);
            Ok(points
                .iter()
                .map(|p| TimestampedValue {
                    point_id: p.id.clone(),
                    value: DataValue::Float(base as f64),
                    quality: Quality::Good,
                    timestamp: chrono::Utc::now(),
                    sequence: 0,
                })
                .collect::<Vec<_>>())
        };

        let elapsed = started.elapsed();
        self.state.read_spans.lock().push((started, Instant::now()));
        match &result {
            Ok(values) => self.stats.record_read(true, values.len(), elapsed),
            Err(_) => self.stats.record_read(false, 0, elapsed),
        }
        result
    }

    async fn write_value(&mut self, point: &DataPoint, _value: DataValue) -> Result<()> {
        self.state.write_calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let result = if !self.is_connected() {
            self.set_last_error("write while disconnected");
            Err(ColSrvError::connection("write while disconnected"))
        } else if self.state.fail_writes.load(Ordering::SeqCst) {
            self.set_last_error(format!("simulated write failure: {}", point.id));
            Err(ColSrvError::protocol("simulated write failure"))
        } else {
            Ok(())
        };

        self.stats.record_write(result.is_ok(), started.elapsed());
        result
    }

    async fn keep_alive(&mut self) -> Result<()> {
        let calls = self.state.keep_alive_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.fail_alternate_keep_alives.load(Ordering::SeqCst) && calls % 2 == 1 {
            self.set_last_error("simulated keep-alive failure");
            return Err(ColSrvError::timeout("simulated keep-alive failure"));
        }
        if self.is_connected() {
            Ok(())
        } else {
            self.set_last_error("keep-alive: link down");
            Err(ColSrvError::connection("keep-alive: link down"))
        }
    }

    fn statistics(&self) -> Arc<DriverStatistics> {
        self.stats.clone()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::event_channel;

    fn test_point(id: &str) -> DataPoint {
        DataPoint {
            id: id.to_string(),
            name: id.to_string(),
            address: "0".to_string(),
            data_type: Default::default(),
            params: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let mut driver = MockDriver::new("sim");
        let handle = driver.handle();
        let (tx, _rx) = event_channel();
        driver
            .initialize(
                DriverConfig {
                    endpoint: "sim://test".into(),
                    timeout: Duration::from_secs(1),
                    properties: Default::default(),
                },
                tx,
            )
            .await
            .unwrap();

        handle.fail_next_connects(2);
        assert!(driver.connect().await.is_err());
        assert!(driver.connect().await.is_err());
        assert!(driver.connect().await.is_ok());
        assert_eq!(handle.connect_attempts(), 3);
        assert!(driver.is_connected());
        assert_eq!(driver.statistics().connection_errors(), 2);
    }

    #[tokio::test]
    async fn test_read_produces_values_per_point() {
        let mut driver = MockDriver::new("sim");
        let (tx, _rx) = event_channel();
        driver
            .initialize(
                DriverConfig {
                    endpoint: "sim://test".into(),
                    timeout: Duration::from_secs(1),
                    properties: Default::default(),
                },
                tx,
            )
            .await
            .unwrap();
        driver.connect().await.unwrap();

        let points = vec![test_point("p1"), test_point("p2")];
        let values = driver.read_values(&points).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].point_id, "p1");
    }

    #[tokio::test]
    async fn test_link_down_breaks_keep_alive() {
        let mut driver = MockDriver::new("sim");
        let handle = driver.handle();
        let (tx, _rx) = event_channel();
        driver
            .initialize(
                DriverConfig {
                    endpoint: "sim://test".into(),
                    timeout: Duration::from_secs(1),
                    properties: Default::default(),
                },
                tx,
            )
            .await
            .unwrap();
        driver.connect().await.unwrap();

        assert!(driver.keep_alive().await.is_ok());
        handle.set_link_down(true);
        assert!(!driver.is_connected());
        assert!(driver.keep_alive().await.is_err());
        assert_eq!(handle.keep_alive_calls(), 2);
    }
}
