//! Managed task lifecycle
//!
//! [`TaskLifecycleManager`] hosts N independently named long-running loops
//! and lets callers control each by name: start, stop with a bounded wait,
//! cooperative pause/resume, and heartbeat-based health checks. Every
//! protocol worker reuses the same start/stop/pause semantics instead of
//! re-implementing loop bookkeeping.
//!
//! Each registered body is one *iteration* of a loop. The supervising
//! wrapper runs the body repeatedly, increments the heartbeat on every pass,
//! and catches panics at the iteration boundary: a panicking or failing body
//! is logged with context and the task marked stopped with a recorded fault,
//! instead of taking the process down.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// How often a paused wrapper wakes to beat and re-check its flags.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Polling step used while waiting for a task to observe its stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle state of one managed task. Independent from the owning
/// worker's state: a polling task can be paused while the reconnect task
/// keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Stopped => "Stopped",
            TaskState::Starting => "Starting",
            TaskState::Running => "Running",
            TaskState::Paused => "Paused",
            TaskState::Stopping => "Stopping",
        };
        write!(f, "{}", s)
    }
}

/// Atomic cell holding a [`TaskState`].
#[derive(Debug)]
struct TaskStateCell(AtomicU8);

impl TaskStateCell {
    fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TaskState {
        match self.0.load(Ordering::SeqCst) {
            0 => TaskState::Stopped,
            1 => TaskState::Starting,
            2 => TaskState::Running,
            3 => TaskState::Paused,
            _ => TaskState::Stopping,
        }
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// Run another iteration
    Continue,
    /// End the loop cleanly (task transitions to Stopped without a fault)
    Shutdown,
}

/// Context handed to each iteration so bodies can make their blocking waits
/// cancellation-aware.
#[derive(Clone)]
pub struct TaskContext {
    /// Cancelled when a stop has been requested for this task.
    pub stop: CancellationToken,
}

/// One iteration of a managed loop.
pub type TaskBody = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<LoopStep>> + Send + Sync>;

/// Hook invoked when a task body faults (panic or unrecoverable error).
/// Receives the task name and a fault description.
pub type FaultHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct ManagedTask {
    body: TaskBody,
    state: Arc<TaskStateCell>,
    heartbeat: Arc<AtomicU64>,
    /// Milliseconds since the manager epoch at the last heartbeat.
    last_beat_ms: Arc<AtomicU64>,
    pause_requested: Arc<AtomicBool>,
    stop_token: CancellationToken,
    started_at: Option<Instant>,
    fault: Arc<Mutex<Option<String>>>,
}

/// Registry of named managed tasks with uniform lifecycle control.
pub struct TaskLifecycleManager {
    /// Owner label used in log lines ("device worker-17", ...)
    owner: String,
    tasks: RwLock<HashMap<String, ManagedTask>>,
    /// Registration order, used by start_all/stop_all and name listing
    order: RwLock<Vec<String>>,
    epoch: Instant,
    fault_hook: Option<FaultHook>,
}

impl TaskLifecycleManager {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            tasks: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            epoch: Instant::now(),
            fault_hook: None,
        }
    }

    /// Manager whose task faults are additionally reported through `hook`.
    pub fn with_fault_hook(owner: impl Into<String>, hook: FaultHook) -> Self {
        let mut manager = Self::new(owner);
        manager.fault_hook = Some(hook);
        manager
    }

    /// Register a task in Stopped state. Fails if the name is taken.
    pub fn register_task(&self, name: impl Into<String>, body: TaskBody) -> bool {
        let name = name.into();
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&name) {
            warn!("[{}] task '{}' already registered", self.owner, name);
            return false;
        }
        tasks.insert(
            name.clone(),
            ManagedTask {
                body,
                state: Arc::new(TaskStateCell::new(TaskState::Stopped)),
                heartbeat: Arc::new(AtomicU64::new(0)),
                last_beat_ms: Arc::new(AtomicU64::new(0)),
                pause_requested: Arc::new(AtomicBool::new(false)),
                stop_token: CancellationToken::new(),
                started_at: None,
                fault: Arc::new(Mutex::new(None)),
            },
        );
        self.order.write().push(name);
        true
    }

    /// Remove a task from the registry. Fails unless the task is Stopped.
    pub fn unregister_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.get(name) {
            Some(task) if task.state.load() == TaskState::Stopped => {
                tasks.remove(name);
                self.order.write().retain(|n| n != name);
                true
            }
            Some(task) => {
                warn!(
                    "[{}] cannot unregister task '{}' in state {}",
                    self.owner,
                    name,
                    task.state.load()
                );
                false
            }
            None => false,
        }
    }

    /// Start one task. Starting an already-running task is a no-op success.
    pub fn start_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(name) else {
            return false;
        };

        match task.state.load() {
            TaskState::Running | TaskState::Starting | TaskState::Paused => return true,
            TaskState::Stopping => {
                warn!("[{}] task '{}' is still stopping", self.owner, name);
                return false;
            }
            TaskState::Stopped => {}
        }

        // A cancelled token cannot be reused; each start gets a fresh one.
        task.stop_token = CancellationToken::new();
        task.pause_requested.store(false, Ordering::SeqCst);
        *task.fault.lock() = None;
        task.started_at = Some(Instant::now());
        task.state.store(TaskState::Starting);

        let wrapper = TaskWrapper {
            owner: self.owner.clone(),
            name: name.to_string(),
            body: task.body.clone(),
            state: task.state.clone(),
            heartbeat: task.heartbeat.clone(),
            last_beat_ms: task.last_beat_ms.clone(),
            pause_requested: task.pause_requested.clone(),
            stop_token: task.stop_token.clone(),
            fault: task.fault.clone(),
            epoch: self.epoch,
            fault_hook: self.fault_hook.clone(),
        };
        tokio::spawn(wrapper.run());
        true
    }

    /// Start every registered task, in registration order.
    pub fn start_all(&self) -> bool {
        let names = self.order.read().clone();
        names.iter().all(|name| self.start_task(name))
    }

    /// Request a stop and wait up to `timeout` for the loop to observe it.
    ///
    /// Returns false on timeout; the task is then left running and the
    /// caller must not assume it stopped.
    pub async fn stop_task(&self, name: &str, timeout: Duration) -> bool {
        let (state, token) = {
            let tasks = self.tasks.read();
            let Some(task) = tasks.get(name) else {
                return false;
            };
            if task.state.load() == TaskState::Stopped {
                return true;
            }
            task.state.store(TaskState::Stopping);
            (task.state.clone(), task.stop_token.clone())
        };

        token.cancel();

        let deadline = Instant::now() + timeout;
        loop {
            if state.load() == TaskState::Stopped {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("[{}] task '{}' did not stop within {:?}", self.owner, name, timeout);
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Stop every task; the timeout bounds the total wait.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let names = self.order.read().clone();
        let deadline = Instant::now() + timeout;

        // Cancel everything first so the loops wind down concurrently.
        {
            let tasks = self.tasks.read();
            for name in &names {
                if let Some(task) = tasks.get(name) {
                    if task.state.load() != TaskState::Stopped {
                        task.state.store(TaskState::Stopping);
                        task.stop_token.cancel();
                    }
                }
            }
        }

        let mut all_stopped = true;
        for name in &names {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.wait_for_stop(name, remaining).await {
                all_stopped = false;
            }
        }
        all_stopped
    }

    async fn wait_for_stop(&self, name: &str, timeout: Duration) -> bool {
        let state = {
            let tasks = self.tasks.read();
            match tasks.get(name) {
                Some(task) => task.state.clone(),
                None => return true,
            }
        };
        let deadline = Instant::now() + timeout;
        loop {
            if state.load() == TaskState::Stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Request a cooperative pause. The loop observes the flag at its next
    /// safe point; execution is never suspended forcibly.
    pub fn pause_task(&self, name: &str) -> bool {
        let tasks = self.tasks.read();
        match tasks.get(name) {
            Some(task) if matches!(task.state.load(), TaskState::Running | TaskState::Starting) => {
                task.pause_requested.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Clear the pause flag.
    pub fn resume_task(&self, name: &str) -> bool {
        let tasks = self.tasks.read();
        match tasks.get(name) {
            Some(task) if matches!(task.state.load(), TaskState::Paused | TaskState::Running) => {
                task.pause_requested.store(false, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.read().get(name).map(|t| t.state.load())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn heartbeat(&self, name: &str) -> Option<u64> {
        self.tasks.read().get(name).map(|t| t.heartbeat.load(Ordering::SeqCst))
    }

    /// Fault recorded for a task, if its last run ended abnormally.
    pub fn task_fault(&self, name: &str) -> Option<String> {
        self.tasks.read().get(name).and_then(|t| t.fault.lock().clone())
    }

    pub fn all_tasks_running(&self) -> bool {
        let tasks = self.tasks.read();
        !tasks.is_empty()
            && tasks
                .values()
                .all(|t| matches!(t.state.load(), TaskState::Running | TaskState::Paused))
    }

    /// A task is healthy when it is running (or paused) and its heartbeat
    /// advanced within `window`. A running task with a stale heartbeat is
    /// reported unhealthy (likely blocked in I/O) without being killed.
    pub fn check_task_health(&self, window: Duration) -> bool {
        self.unhealthy_tasks(window).is_empty()
    }

    /// Names of tasks whose heartbeat is stale.
    pub fn unhealthy_tasks(&self, window: Duration) -> Vec<String> {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let window_ms = window.as_millis() as u64;
        let tasks = self.tasks.read();
        self.order
            .read()
            .iter()
            .filter(|name| {
                tasks.get(name.as_str()).is_some_and(|task| {
                    matches!(task.state.load(), TaskState::Running | TaskState::Paused)
                        && now_ms.saturating_sub(task.last_beat_ms.load(Ordering::SeqCst)) > window_ms
                })
            })
            .cloned()
            .collect()
    }

    /// Status introspection for admin/health endpoints.
    pub fn status_json(&self) -> serde_json::Value {
        let tasks = self.tasks.read();
        let entries: Vec<serde_json::Value> = self
            .order
            .read()
            .iter()
            .filter_map(|name| {
                tasks.get(name.as_str()).map(|task| {
                    serde_json::json!({
                        "name": name,
                        "state": task.state.load(),
                        "heartbeat": task.heartbeat.load(Ordering::SeqCst),
                        "uptime_seconds": task.started_at.map(|t| t.elapsed().as_secs()),
                        "fault": task.fault.lock().clone(),
                    })
                })
            })
            .collect();
        serde_json::json!({ "owner": self.owner, "tasks": entries })
    }
}

/// Everything the supervising wrapper needs, detached from the registry so
/// the spawned future owns no lock.
struct TaskWrapper {
    owner: String,
    name: String,
    body: TaskBody,
    state: Arc<TaskStateCell>,
    heartbeat: Arc<AtomicU64>,
    last_beat_ms: Arc<AtomicU64>,
    pause_requested: Arc<AtomicBool>,
    stop_token: CancellationToken,
    fault: Arc<Mutex<Option<String>>>,
    epoch: Instant,
    fault_hook: Option<FaultHook>,
}

impl TaskWrapper {
    fn beat(&self) {
        self.heartbeat.fetch_add(1, Ordering::SeqCst);
        self.last_beat_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    fn record_fault(&self, message: &str) {
        error!("[{}] task '{}' faulted: {}", self.owner, self.name, message);
        *self.fault.lock() = Some(message.to_string());
        if let Some(hook) = &self.fault_hook {
            hook(&self.name, message);
        }
    }

    async fn run(self) {
        self.state.store(TaskState::Running);
        self.beat();
        info!("[{}] task '{}' started", self.owner, self.name);

        loop {
            if self.stop_token.is_cancelled() {
                break;
            }

            if self.pause_requested.load(Ordering::SeqCst) {
                if self.state.load() == TaskState::Running {
                    self.state.store(TaskState::Paused);
                    debug!("[{}] task '{}' paused", self.owner, self.name);
                }
                // Paused tasks still beat so health checks can tell
                // "paused" from "wedged".
                self.beat();
                tokio::select! {
                    _ = self.stop_token.cancelled() => break,
                    _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                }
                continue;
            }

            if self.state.load() == TaskState::Paused {
                self.state.store(TaskState::Running);
                debug!("[{}] task '{}' resumed", self.owner, self.name);
            }

            let context = TaskContext {
                stop: self.stop_token.clone(),
            };
            let step = AssertUnwindSafe((self.body)(context)).catch_unwind().await;
            self.beat();

            match step {
                Ok(Ok(LoopStep::Continue)) => {}
                Ok(Ok(LoopStep::Shutdown)) => break,
                Ok(Err(e)) => {
                    self.record_fault(&e.to_string());
                    break;
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic with non-string payload".to_string());
                    self.record_fault(&format!("panic: {}", message));
                    break;
                }
            }
        }

        self.state.store(TaskState::Stopped);
        info!("[{}] task '{}' stopped", self.owner, self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_body(counter: Arc<AtomicU32>, period: Duration) -> TaskBody {
        Arc::new(move |ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = ctx.stop.cancelled() => Ok(LoopStep::Shutdown),
                    _ = tokio::time::sleep(period) => Ok(LoopStep::Continue),
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let manager = TaskLifecycleManager::new("test");
        let counter = Arc::new(AtomicU32::new(0));
        assert!(manager.register_task("loop", counting_body(counter.clone(), Duration::from_millis(5))));
        assert!(!manager.register_task("loop", counting_body(counter, Duration::from_millis(5))));
        assert_eq!(manager.task_names(), vec!["loop".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_running_fails() {
        let manager = TaskLifecycleManager::new("test");
        let counter = Arc::new(AtomicU32::new(0));
        manager.register_task("loop", counting_body(counter, Duration::from_millis(5)));
        assert!(manager.start_task("loop"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!manager.unregister_task("loop"));
        assert!(manager.stop_task("loop", Duration::from_secs(1)).await);
        assert!(manager.unregister_task("loop"));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = TaskLifecycleManager::new("test");
        let counter = Arc::new(AtomicU32::new(0));
        manager.register_task("loop", counting_body(counter.clone(), Duration::from_millis(5)));

        assert_eq!(manager.task_state("loop"), Some(TaskState::Stopped));
        assert!(manager.start_task("loop"));
        // Starting an already-running task is a no-op success
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.start_task("loop"));

        assert_eq!(manager.task_state("loop"), Some(TaskState::Running));
        assert!(counter.load(Ordering::SeqCst) > 0);
        assert!(manager.all_tasks_running());

        assert!(manager.stop_task("loop", Duration::from_secs(1)).await);
        assert_eq!(manager.task_state("loop"), Some(TaskState::Stopped));
        // Stopping an already-stopped task succeeds
        assert!(manager.stop_task("loop", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stop_timeout_leaves_task_running() {
        let manager = TaskLifecycleManager::new("test");
        // Body that ignores cancellation for longer than the stop timeout
        manager.register_task(
            "stubborn",
            Arc::new(|_ctx: TaskContext| {
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(LoopStep::Continue)
                }
                .boxed()
            }),
        );
        manager.start_task("stubborn");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!manager.stop_task("stubborn", Duration::from_millis(50)).await);
        // The loop eventually observes the cancelled token and exits
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(manager.task_state("stubborn"), Some(TaskState::Stopped));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let manager = TaskLifecycleManager::new("test");
        let counter = Arc::new(AtomicU32::new(0));
        manager.register_task("loop", counting_body(counter.clone(), Duration::from_millis(5)));
        manager.start_task("loop");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(manager.pause_task("loop"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.task_state("loop"), Some(TaskState::Paused));

        let frozen = counter.load(Ordering::SeqCst);
        let beat_before = manager.heartbeat("loop").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Body iterations are frozen, but the heartbeat keeps advancing
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
        assert!(manager.heartbeat("loop").unwrap() > beat_before);

        assert!(manager.resume_task("loop"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) > frozen);
        assert_eq!(manager.task_state("loop"), Some(TaskState::Running));

        manager.stop_task("loop", Duration::from_secs(1)).await;
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_panic_is_caught_and_reported() {
        let faults: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_faults = faults.clone();
        let manager = TaskLifecycleManager::with_fault_hook(
            "test",
            Arc::new(move |name, msg| {
                hook_faults.lock().push((name.to_string(), msg.to_string()));
            }),
        );

        manager.register_task(
            "crasher",
            Arc::new(|_ctx: TaskContext| {
                async {
                    panic!("boom");
                    #[allow(unreachable_code)]
                    Ok(LoopStep::Continue)
                }
                .boxed()
            }),
        );
        manager.start_task("crasher");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.task_state("crasher"), Some(TaskState::Stopped));
        let fault = manager.task_fault("crasher").unwrap();
        assert!(fault.contains("boom"));
        assert_eq!(faults.lock().len(), 1);
        assert!(logs_contain("task 'crasher' faulted"));
    }

    #[tokio::test]
    async fn test_health_check_detects_stale_heartbeat() {
        let manager = TaskLifecycleManager::new("test");
        // Body that wedges on the first iteration without ever beating again
        manager.register_task(
            "wedged",
            Arc::new(|_ctx: TaskContext| {
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(LoopStep::Continue)
                }
                .boxed()
            }),
        );
        manager.start_task("wedged");
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!manager.check_task_health(Duration::from_millis(50)));
        assert_eq!(manager.unhealthy_tasks(Duration::from_millis(50)), vec!["wedged".to_string()]);
        // Generous window: still healthy
        assert!(manager.check_task_health(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_status_json_shape() {
        let manager = TaskLifecycleManager::new("w-1");
        let counter = Arc::new(AtomicU32::new(0));
        manager.register_task("poll", counting_body(counter, Duration::from_millis(5)));
        manager.start_task("poll");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = manager.status_json();
        assert_eq!(status["owner"], "w-1");
        assert_eq!(status["tasks"][0]["name"], "poll");
        assert_eq!(status["tasks"][0]["state"], "running");

        manager.stop_task("poll", Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let manager = TaskLifecycleManager::new("test");
        let counter = Arc::new(AtomicU32::new(0));
        manager.register_task("loop", counting_body(counter.clone(), Duration::from_millis(5)));

        manager.start_task("loop");
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop_task("loop", Duration::from_secs(1)).await;

        let before = counter.load(Ordering::SeqCst);
        assert!(manager.start_task("loop"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(counter.load(Ordering::SeqCst) > before);
        manager.stop_task("loop", Duration::from_secs(1)).await;
    }
}
