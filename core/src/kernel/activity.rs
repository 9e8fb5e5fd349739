//! Per-kernel activity tracking
//!
//! Tracks last-activity timestamps, drives inactivity eviction, and watches
//! ongoing executions for stalls. Eviction requests are delivered over a
//! channel; the manager owns the actual destroy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::event::{EventPayload, KernelEvent};
use super::types::{ExecutionInfo, KernelId};
use super::EventBus;

struct ExecutionRecord {
    started_at: Instant,
    watchdog: Option<JoinHandle<()>>,
}

struct ActivityState {
    last_activity: Instant,
    inactivity_timeout: Option<Duration>,
    inactivity_task: Option<JoinHandle<()>>,
    max_execution_time: Option<Duration>,
    ongoing: HashMap<String, ExecutionRecord>,
}

struct TrackerInner {
    bus: Arc<EventBus>,
    states: Mutex<HashMap<KernelId, ActivityState>>,
    evictions: mpsc::UnboundedSender<KernelId>,
}

/// Tracks activity for every registered kernel
///
/// The inactivity timer re-arms instead of evicting while executions are
/// ongoing; the stall watchdog reports but never terminates.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<TrackerInner>,
}

impl ActivityTracker {
    /// Create a tracker and the receiver on which eviction requests arrive
    pub fn new(bus: Arc<EventBus>) -> (Self, mpsc::UnboundedReceiver<KernelId>) {
        let (evictions, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                bus,
                states: Mutex::new(HashMap::new()),
                evictions,
            }),
        };
        (tracker, rx)
    }

    /// Start tracking a kernel. Timeouts of 0 disable the respective timer.
    pub fn register(&self, kernel_id: KernelId, inactivity_timeout_ms: u64, max_execution_time_ms: u64) {
        let state = ActivityState {
            last_activity: Instant::now(),
            inactivity_timeout: duration_from_ms(inactivity_timeout_ms),
            inactivity_task: None,
            max_execution_time: duration_from_ms(max_execution_time_ms),
            ongoing: HashMap::new(),
        };
        self.inner.states.lock().insert(kernel_id.clone(), state);
        if inactivity_timeout_ms > 0 {
            self.arm_inactivity(&kernel_id);
        }
    }

    /// Stop tracking and cancel every timer attributable to the kernel
    pub fn remove(&self, kernel_id: &KernelId) {
        let state = self.inner.states.lock().remove(kernel_id);
        if let Some(state) = state {
            if let Some(task) = state.inactivity_task {
                task.abort();
            }
            for record in state.ongoing.into_values() {
                if let Some(watchdog) = record.watchdog {
                    watchdog.abort();
                }
            }
        }
    }

    /// Record activity, pushing the inactivity deadline forward
    pub fn touch(&self, kernel_id: &KernelId) {
        if let Some(state) = self.inner.states.lock().get_mut(kernel_id) {
            state.last_activity = Instant::now();
        }
    }

    /// Change the inactivity timeout; 0 cancels the timer
    pub fn set_inactivity_timeout(&self, kernel_id: &KernelId, timeout_ms: u64) {
        let previous = {
            let mut states = self.inner.states.lock();
            let Some(state) = states.get_mut(kernel_id) else {
                return;
            };
            state.inactivity_timeout = duration_from_ms(timeout_ms);
            state.last_activity = Instant::now();
            state.inactivity_task.take()
        };
        if let Some(task) = previous {
            task.abort();
        }
        if timeout_ms > 0 {
            self.arm_inactivity(kernel_id);
        }
    }

    /// Spawn the persistent inactivity timer task for a kernel. The task
    /// recomputes its deadline from `last_activity` on every wake, so `touch`
    /// never needs to abort it.
    fn arm_inactivity(&self, kernel_id: &KernelId) {
        let weak = Arc::downgrade(&self.inner);
        let id = kernel_id.clone();
        let task = tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = weak.upgrade() else { return };
                    let states = inner.states.lock();
                    let Some(state) = states.get(&id) else { return };
                    let Some(timeout) = state.inactivity_timeout else {
                        return;
                    };
                    state.last_activity + timeout
                };
                sleep_until(deadline).await;

                let Some(inner) = weak.upgrade() else { return };
                let evict = {
                    let mut states = inner.states.lock();
                    let Some(state) = states.get_mut(&id) else { return };
                    let Some(timeout) = state.inactivity_timeout else {
                        return;
                    };
                    if state.last_activity + timeout > Instant::now() {
                        // Touched since we went to sleep.
                        false
                    } else if !state.ongoing.is_empty() {
                        // Executions in flight: defer by re-arming from now.
                        state.last_activity = Instant::now();
                        false
                    } else {
                        true
                    }
                };
                if evict {
                    debug!(kernel = %id, "inactivity timeout expired, requesting eviction");
                    let _ = inner.evictions.send(id.clone());
                    return;
                }
            }
        });

        if let Some(state) = self.inner.states.lock().get_mut(kernel_id) {
            if let Some(old) = state.inactivity_task.replace(task) {
                old.abort();
            }
        } else {
            // Kernel vanished between registration and arming.
            task.abort();
        }
    }

    /// Record the start of an execution and arm its stall watchdog when a
    /// deadline is configured. Returns the execution ID.
    pub fn begin_execution(&self, kernel_id: &KernelId) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        let max = {
            let mut states = self.inner.states.lock();
            let state = states.get_mut(kernel_id)?;
            state.last_activity = Instant::now();
            state.ongoing.insert(
                execution_id.clone(),
                ExecutionRecord {
                    started_at: Instant::now(),
                    watchdog: None,
                },
            );
            state.max_execution_time
        };

        if let Some(max) = max {
            let weak = Arc::downgrade(&self.inner);
            let id = kernel_id.clone();
            let exec_id = execution_id.clone();
            let watchdog = tokio::spawn(async move {
                sleep(max).await;
                let Some(inner) = weak.upgrade() else { return };
                let still_running = inner
                    .states
                    .lock()
                    .get(&id)
                    .map(|state| state.ongoing.contains_key(&exec_id))
                    .unwrap_or(false);
                if still_running {
                    warn!(kernel = %id, execution = %exec_id, "execution exceeded its deadline");
                    inner.bus.emit(&KernelEvent::new(
                        id.clone(),
                        EventPayload::ExecutionStalled {
                            execution_id: exec_id,
                            max_execution_time_ms: max.as_millis() as u64,
                        },
                    ));
                }
            });
            let mut states = self.inner.states.lock();
            if let Some(record) = states
                .get_mut(kernel_id)
                .and_then(|state| state.ongoing.get_mut(&execution_id))
            {
                record.watchdog = Some(watchdog);
            } else {
                watchdog.abort();
            }
        }

        Some(execution_id)
    }

    /// Record the end of an execution: cancel its watchdog and touch activity
    pub fn end_execution(&self, kernel_id: &KernelId, execution_id: &str) {
        let record = {
            let mut states = self.inner.states.lock();
            let Some(state) = states.get_mut(kernel_id) else {
                return;
            };
            state.last_activity = Instant::now();
            state.ongoing.remove(execution_id)
        };
        if let Some(record) = record {
            if let Some(watchdog) = record.watchdog {
                watchdog.abort();
            }
        }
    }

    /// Point-in-time execution statistics for one kernel
    pub fn execution_info(&self, kernel_id: &KernelId) -> ExecutionInfo {
        let states = self.inner.states.lock();
        let Some(state) = states.get(kernel_id) else {
            return ExecutionInfo::default();
        };
        let longest_running_ms = state
            .ongoing
            .values()
            .map(|record| record.started_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);
        let is_stuck = state
            .max_execution_time
            .map(|max| longest_running_ms > max.as_millis() as u64)
            .unwrap_or(false);
        ExecutionInfo {
            count: state.ongoing.len(),
            is_stuck,
            longest_running_ms,
        }
    }

    /// Whether the kernel is currently tracked. Used by leak checks.
    pub fn is_tracked(&self, kernel_id: &KernelId) -> bool {
        self.inner.states.lock().contains_key(kernel_id)
    }
}

fn duration_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
