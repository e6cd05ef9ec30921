//! Device worker
//!
//! A [`DeviceWorker`] owns exactly one device's identity, one driver
//! instance, and the managed tasks that keep the session alive:
//!
//! - `poll`: asks the schedule which groups are due and issues one batched
//!   read per due group, forwarding results to the pipeline,
//! - `reconnect`: the only place connect/disconnect is driven after
//!   startup, so the poll loop never races a connection attempt,
//! - `events`: drains the driver's status/fault channel and tags events
//!   with the device id.
//!
//! The worker state machine: Stopped → Starting → Running ⇄ Paused,
//! Running → Reconnecting → Running, any → Error on a task fault. Error is
//! equivalent to Stopped for external callers; recovery requires an
//! explicit stop/start.

pub mod polling;
pub mod reconnect;

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::driver::{
    event_channel, DriverConfig, DriverEvent, DriverEventRx, DriverStatistics, DriverStatsSnapshot,
    ProtocolDriver,
};
use crate::core::pipeline::PipelineSink;
use crate::core::tasks::{LoopStep, TaskBody, TaskContext, TaskLifecycleManager};
use crate::core::types::{ConnectionStatus, DataPoint, DataValue, DeviceConfig, WorkerState};
use crate::error::{ColSrvError, Result};
use polling::{BusLock, DueGroup, GroupAddress, PollingSchedule};
use reconnect::ReconnectPolicy;

/// Task names owned by every worker.
pub const TASK_POLL: &str = "poll";
pub const TASK_RECONNECT: &str = "reconnect";
pub const TASK_EVENTS: &str = "events";

/// Idle tick for the supervisor and event loops; keeps their heartbeats
/// advancing while there is nothing to do.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Atomic cell for [`WorkerState`].
#[derive(Debug)]
struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
    fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> WorkerState {
        match self.0.load(Ordering::SeqCst) {
            0 => WorkerState::Stopped,
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Paused,
            4 => WorkerState::Reconnecting,
            _ => WorkerState::Error,
        }
    }

    fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Atomic cell for the last observed wire status.
#[derive(Debug)]
struct WireStatusCell(AtomicU8);

impl WireStatusCell {
    fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> ConnectionStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionStatus::Disconnected,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Error,
        }
    }

    fn store(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// State shared between the worker facade and its task bodies.
struct WorkerShared {
    device: DeviceConfig,
    points: HashMap<String, DataPoint>,
    driver: tokio::sync::Mutex<Box<dyn ProtocolDriver>>,
    state: WorkerStateCell,
    wire_status: WireStatusCell,
    schedule: PollingSchedule,
    pipeline: Arc<dyn PipelineSink>,
    bus: Option<BusLock>,
    reconnect_signal: Notify,
    reconnect_attempt: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Operator pause flag, independent of the state machine so a
    /// reconnection finishing mid-pause lands back in Paused.
    paused: AtomicBool,
    policy: ReconnectPolicy,
    stats: Arc<DriverStatistics>,
    sequence: AtomicU32,
    event_rx: tokio::sync::Mutex<Option<DriverEventRx>>,
    last_keep_alive: Mutex<Option<Instant>>,
}

impl WorkerShared {
    /// Single funnel for worker state mutation; logs every edge once.
    fn change_state(&self, new_state: WorkerState) {
        let old_state = self.state.load();
        if old_state == new_state {
            return;
        }
        self.state.store(new_state);
        info!(
            "[{}] worker state: {} -> {}",
            self.device.id, old_state, new_state
        );
    }

    /// Flip into Reconnecting (from Running/Starting) and wake the
    /// supervisor. The lost-connection edge is logged here, once, not per
    /// retry attempt.
    fn trigger_reconnect(&self, reason: &str) {
        let state = self.state.load();
        if matches!(state, WorkerState::Running | WorkerState::Starting | WorkerState::Paused) {
            warn!("[{}] connection lost ({}), reconnecting", self.device.id, reason);
            self.reconnect_attempt.store(0, Ordering::SeqCst);
            self.change_state(WorkerState::Reconnecting);
        }
        self.reconnect_signal.notify_one();
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Count one failed read/keep-alive; trips the reconnect path when the
    /// configured consecutive-failure budget is exhausted.
    fn record_io_failure(&self, what: &str, err: &ColSrvError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let budget = self.device.max_consecutive_failures;
        debug!(
            "[{}] {} failed ({}/{}): {}",
            self.device.id, what, failures, budget, err
        );
        if failures >= budget {
            self.trigger_reconnect("consecutive failure budget exhausted");
        }
    }

    fn handle_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::StatusChanged(status) => {
                self.wire_status.store(status);
                debug!("[{}] driver status: {}", self.device.id, status);
                if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error)
                    && matches!(self.state.load(), WorkerState::Running | WorkerState::Paused)
                {
                    self.trigger_reconnect("driver reported disconnect");
                }
            }
            DriverEvent::Fault(message) => {
                warn!("[{}] driver fault: {}", self.device.id, message);
            }
        }
    }

    /// One batched read of a due group, holding the bus lock (if any) for
    /// exactly the duration of the read.
    async fn read_group(&self, group: &DueGroup) -> Result<Vec<crate::core::types::TimestampedValue>> {
        let _bus_guard = match &self.bus {
            Some(bus) => Some(bus.clone().lock_owned().await),
            None => None,
        };
        let mut driver = self.driver.lock().await;
        driver.read_values(&group.points).await
    }
}

/// One poll-loop iteration.
fn poll_body(shared: Arc<WorkerShared>) -> TaskBody {
    Arc::new(move |ctx: TaskContext| {
        let shared = shared.clone();
        async move {
            let tick = shared.device.poll_tick();

            if shared.state.load() != WorkerState::Running {
                // Starting/Reconnecting: connection work belongs to the
                // supervisor; just wait out the tick.
                tokio::select! {
                    _ = ctx.stop.cancelled() => return Ok(LoopStep::Shutdown),
                    _ = tokio::time::sleep(tick) => return Ok(LoopStep::Continue),
                }
            }

            // A silently dead link is detected here, before any read.
            let connected = shared.driver.lock().await.is_connected();
            if !connected {
                shared.trigger_reconnect("driver reports link down");
                return Ok(LoopStep::Continue);
            }

            // Keep-alive probe on the polling cadence; a failure counts
            // exactly like a read failure.
            if let Some(keep_alive_interval) = shared.device.keep_alive_interval() {
                let due = shared
                    .last_keep_alive
                    .lock()
                    .map_or(true, |t| t.elapsed() >= keep_alive_interval);
                if due {
                    let probe = {
                        let mut driver = shared.driver.lock().await;
                        driver.keep_alive().await
                    };
                    *shared.last_keep_alive.lock() = Some(Instant::now());
                    match probe {
                        // A live probe proves the link; the failure budget
                        // stays strictly consecutive.
                        Ok(()) => shared.consecutive_failures.store(0, Ordering::SeqCst),
                        Err(e) => shared.record_io_failure("keep-alive", &e),
                    }
                }
            }

            for group in shared.schedule.due_groups(Instant::now()) {
                if ctx.stop.is_cancelled() {
                    return Ok(LoopStep::Shutdown);
                }
                if shared.state.load() != WorkerState::Running {
                    break;
                }

                match shared.read_group(&group).await {
                    Ok(mut values) => {
                        shared.consecutive_failures.store(0, Ordering::SeqCst);
                        shared.schedule.mark_polled(group.id, true, Instant::now());
                        for value in &mut values {
                            value.sequence = shared.next_sequence();
                        }
                        shared.pipeline.send(values).await;
                    }
                    Err(e) => {
                        shared.schedule.mark_polled(group.id, false, Instant::now());
                        shared.record_io_failure(&format!("group '{}' read", group.name), &e);
                        if shared.state.load() != WorkerState::Running {
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = ctx.stop.cancelled() => Ok(LoopStep::Shutdown),
                _ = tokio::time::sleep(tick) => Ok(LoopStep::Continue),
            }
        }
        .boxed()
    })
}

/// One reconnect-supervisor iteration: idle until signalled, then one
/// connection attempt per pass (so the heartbeat advances between
/// attempts), with policy backoff ahead of every retry.
fn reconnect_body(shared: Arc<WorkerShared>) -> TaskBody {
    Arc::new(move |ctx: TaskContext| {
        let shared = shared.clone();
        async move {
            if shared.state.load() != WorkerState::Reconnecting {
                tokio::select! {
                    _ = ctx.stop.cancelled() => return Ok(LoopStep::Shutdown),
                    _ = shared.reconnect_signal.notified() => return Ok(LoopStep::Continue),
                    _ = tokio::time::sleep(IDLE_TICK) => return Ok(LoopStep::Continue),
                }
            }

            let attempt = shared.reconnect_attempt.load(Ordering::SeqCst);
            if attempt > 0 {
                let delay = shared.policy.delay_for(attempt - 1);
                tokio::select! {
                    _ = ctx.stop.cancelled() => return Ok(LoopStep::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
                // Stop may have landed while we were backing off.
                if shared.state.load() != WorkerState::Reconnecting {
                    return Ok(LoopStep::Continue);
                }
            }

            let connect_result = {
                let mut driver = shared.driver.lock().await;
                let _ = driver.disconnect().await;
                driver.connect().await
            };

            match connect_result {
                Ok(()) => {
                    shared.wire_status.store(ConnectionStatus::Connected);
                    shared.consecutive_failures.store(0, Ordering::SeqCst);
                    shared.reconnect_attempt.store(0, Ordering::SeqCst);
                    let restored = if shared.paused.load(Ordering::SeqCst) {
                        WorkerState::Paused
                    } else {
                        WorkerState::Running
                    };
                    shared.change_state(restored);
                    info!(
                        "[{}] connection re-established (attempt {})",
                        shared.device.id,
                        attempt + 1
                    );
                }
                Err(e) => {
                    shared.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "[{}] reconnect attempt {} failed: {}",
                        shared.device.id,
                        attempt + 1,
                        e
                    );
                }
            }
            Ok(LoopStep::Continue)
        }
        .boxed()
    })
}

/// One event-loop iteration: receive and tag driver events.
fn events_body(shared: Arc<WorkerShared>) -> TaskBody {
    Arc::new(move |ctx: TaskContext| {
        let shared = shared.clone();
        async move {
            let mut guard = shared.event_rx.lock().await;
            let Some(rx) = guard.as_mut() else {
                drop(guard);
                tokio::select! {
                    _ = ctx.stop.cancelled() => return Ok(LoopStep::Shutdown),
                    _ = tokio::time::sleep(IDLE_TICK) => return Ok(LoopStep::Continue),
                }
            };

            tokio::select! {
                _ = ctx.stop.cancelled() => Ok(LoopStep::Shutdown),
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            shared.handle_driver_event(event);
                            Ok(LoopStep::Continue)
                        }
                        // Sender gone (driver replaced or shutting down)
                        None => {
                            tokio::select! {
                                _ = ctx.stop.cancelled() => Ok(LoopStep::Shutdown),
                                _ = tokio::time::sleep(IDLE_TICK) => Ok(LoopStep::Continue),
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => Ok(LoopStep::Continue),
            }
        }
        .boxed()
    })
}

/// Owner of one device's connection lifecycle and polling.
pub struct DeviceWorker {
    shared: Arc<WorkerShared>,
    tasks: TaskLifecycleManager,
}

impl DeviceWorker {
    /// Build a worker from its immutable inputs. The driver arrives by
    /// injection, uninitialized; `bus` is shared by workers on one
    /// physical medium and `None` for point-to-point transports.
    pub fn new(
        device: DeviceConfig,
        points: Vec<DataPoint>,
        driver: Box<dyn ProtocolDriver>,
        pipeline: Arc<dyn PipelineSink>,
        bus: Option<BusLock>,
    ) -> Self {
        let stats = driver.statistics();
        let policy = ReconnectPolicy::for_device(&device);
        let points: HashMap<String, DataPoint> =
            points.into_iter().map(|p| (p.id.clone(), p)).collect();

        let shared = Arc::new(WorkerShared {
            device,
            points,
            driver: tokio::sync::Mutex::new(driver),
            state: WorkerStateCell::new(WorkerState::Stopped),
            wire_status: WireStatusCell::new(ConnectionStatus::Disconnected),
            schedule: PollingSchedule::new(),
            pipeline,
            bus,
            reconnect_signal: Notify::new(),
            reconnect_attempt: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            policy,
            stats,
            sequence: AtomicU32::new(0),
            event_rx: tokio::sync::Mutex::new(None),
            last_keep_alive: Mutex::new(None),
        });

        let hook_shared = shared.clone();
        let tasks = TaskLifecycleManager::with_fault_hook(
            format!("worker {}", shared.device.id),
            Arc::new(move |task, fault| {
                warn!(
                    "[{}] task '{}' fault escalated to worker: {}",
                    hook_shared.device.id, task, fault
                );
                hook_shared.change_state(WorkerState::Error);
            }),
        );

        Self { shared, tasks }
    }

    /// Start the worker. Resolves once the initial connection attempt has
    /// been made; a failed first attempt hands over to the reconnect
    /// supervisor instead of blocking the caller for the retry horizon.
    pub async fn start(&self) -> Result<()> {
        match self.shared.state.load() {
            WorkerState::Stopped => {}
            WorkerState::Error => {
                return Err(ColSrvError::state(
                    "worker is faulted; stop() it before restarting",
                ));
            }
            // Already active: idempotent success
            _ => return Ok(()),
        }

        self.shared.change_state(WorkerState::Starting);

        let (event_tx, event_rx) = event_channel();
        {
            let mut driver = self.shared.driver.lock().await;
            let config = DriverConfig {
                endpoint: self.shared.device.endpoint.clone(),
                timeout: self.shared.device.timeout(),
                properties: self.shared.device.properties.clone(),
            };
            if let Err(e) = driver.initialize(config, event_tx).await {
                drop(driver);
                self.shared.change_state(WorkerState::Stopped);
                return Err(e);
            }
        }
        *self.shared.event_rx.lock().await = Some(event_rx);

        // Tasks survive a stop/start cycle; register them only once.
        if self.tasks.task_names().is_empty() {
            self.tasks.register_task(TASK_EVENTS, events_body(self.shared.clone()));
            self.tasks.register_task(TASK_RECONNECT, reconnect_body(self.shared.clone()));
            self.tasks.register_task(TASK_POLL, poll_body(self.shared.clone()));
        }
        if !self.tasks.start_all() {
            self.shared.change_state(WorkerState::Error);
            return Err(ColSrvError::task("failed to start worker tasks"));
        }

        let connect_result = {
            let mut driver = self.shared.driver.lock().await;
            driver.connect().await
        };
        match connect_result {
            Ok(()) => {
                self.shared.wire_status.store(ConnectionStatus::Connected);
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                self.shared.change_state(WorkerState::Running);
            }
            Err(e) => {
                warn!(
                    "[{}] initial connection failed ({}); reconnect supervisor takes over",
                    self.shared.device.id, e
                );
                self.shared.reconnect_attempt.store(1, Ordering::SeqCst);
                self.shared.change_state(WorkerState::Reconnecting);
                self.shared.reconnect_signal.notify_one();
            }
        }
        Ok(())
    }

    /// Stop the worker: cancel all tasks with a bounded wait, close the
    /// connection, release the event channel. Idempotent.
    ///
    /// If a task fails to observe the stop request within the bound, an
    /// error is returned and nothing is force-killed; the caller must not
    /// assume the worker stopped.
    pub async fn stop(&self) -> Result<()> {
        if self.shared.state.load() == WorkerState::Stopped {
            return Ok(());
        }

        let stopped = self.tasks.stop_all(self.shared.device.stop_timeout()).await;
        if !stopped {
            return Err(ColSrvError::timeout(format!(
                "worker {} tasks did not stop within {:?}",
                self.shared.device.id,
                self.shared.device.stop_timeout()
            )));
        }

        {
            let mut driver = self.shared.driver.lock().await;
            if let Err(e) = driver.disconnect().await {
                warn!("[{}] disconnect on stop failed: {}", self.shared.device.id, e);
            }
        }
        self.shared.wire_status.store(ConnectionStatus::Disconnected);
        self.shared.paused.store(false, Ordering::SeqCst);
        *self.shared.event_rx.lock().await = None;
        self.shared.change_state(WorkerState::Stopped);
        Ok(())
    }

    /// Pause polling. The connection and the reconnect supervisor stay
    /// active; only data collection is suspended.
    pub fn pause(&self) -> Result<()> {
        if self.shared.state.load() != WorkerState::Running {
            return Err(ColSrvError::state(format!(
                "cannot pause worker in state {}",
                self.shared.state.load()
            )));
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        self.tasks.pause_task(TASK_POLL);
        self.shared.change_state(WorkerState::Paused);
        Ok(())
    }

    /// Resume polling after a pause.
    pub fn resume(&self) -> Result<()> {
        if self.shared.state.load() != WorkerState::Paused {
            return Err(ColSrvError::state(format!(
                "cannot resume worker in state {}",
                self.shared.state.load()
            )));
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.tasks.resume_task(TASK_POLL);
        self.shared.change_state(WorkerState::Running);
        Ok(())
    }

    /// Write one value to one point. Fails fast without touching the
    /// driver when the point is unknown or the worker holds no usable
    /// connection. Never retried at this layer: write commands are
    /// side-effecting and retrying is the caller's decision.
    pub async fn write_data_point(&self, point_id: &str, value: DataValue) -> Result<()> {
        let point = self
            .shared
            .points
            .get(point_id)
            .ok_or_else(|| ColSrvError::point(format!("unknown point id: {}", point_id)))?
            .clone();

        let state = self.shared.state.load();
        if !matches!(state, WorkerState::Running | WorkerState::Paused) {
            return Err(ColSrvError::state(format!(
                "cannot write in worker state {}",
                state
            )));
        }

        let _bus_guard = match &self.shared.bus {
            Some(bus) => Some(bus.clone().lock_owned().await),
            None => None,
        };
        let mut driver = self.shared.driver.lock().await;
        driver.write_value(&point, value).await
    }

    /// Cheap, non-blocking health query: worker state plus the last
    /// observed wire status.
    pub fn check_connection(&self) -> bool {
        matches!(
            self.shared.state.load(),
            WorkerState::Running | WorkerState::Paused
        ) && self.shared.wire_status.load().is_connected()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.load()
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device.id
    }

    /// Add a polling group over configured points; the group is due
    /// immediately. Unknown point ids are rejected before the schedule is
    /// touched.
    pub fn add_polling_group(
        &self,
        name: impl Into<String>,
        address: GroupAddress,
        interval: Duration,
        point_ids: &[String],
    ) -> Result<u32> {
        let mut points = Vec::with_capacity(point_ids.len());
        for id in point_ids {
            let point = self
                .shared
                .points
                .get(id)
                .ok_or_else(|| ColSrvError::point(format!("unknown point id: {}", id)))?;
            points.push(point.clone());
        }
        self.shared.schedule.add_group(name, address, interval, points)
    }

    pub fn remove_polling_group(&self, group_id: u32) -> bool {
        self.shared.schedule.remove_group(group_id)
    }

    pub fn set_polling_group_enabled(&self, group_id: u32, enabled: bool) -> bool {
        self.shared.schedule.set_group_enabled(group_id, enabled)
    }

    pub fn polling_group_ids(&self) -> Vec<u32> {
        self.shared.schedule.group_ids()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.task_names()
    }

    /// Heartbeat counter of one owned task, for health probes and tests.
    pub fn task_heartbeat(&self, name: &str) -> Option<u64> {
        self.tasks.heartbeat(name)
    }

    /// A worker is healthy when all its tasks beat within `window`.
    pub fn check_task_health(&self, window: Duration) -> bool {
        self.tasks.check_task_health(window)
    }

    pub fn statistics(&self) -> DriverStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Explicit statistics reset; never performed implicitly.
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }

    /// Status introspection for admin/health endpoints: worker state, wire
    /// status, per-task states and heartbeats, group schedule, cumulative
    /// driver statistics.
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "device": {
                "id": self.shared.device.id,
                "name": self.shared.device.name,
                "protocol": self.shared.device.protocol,
                "endpoint": self.shared.device.endpoint,
            },
            "state": self.shared.state.load(),
            "connection_status": self.shared.wire_status.load(),
            "consecutive_failures": self.shared.consecutive_failures.load(Ordering::SeqCst),
            "tasks": self.tasks.status_json(),
            "polling_groups": self.shared.schedule.status_json(),
            "statistics": self.shared.stats.snapshot(),
        })
    }
}
