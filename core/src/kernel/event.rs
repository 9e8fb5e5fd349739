//! Kernel event taxonomy and the per-manager event bus
//!
//! Engines emit `EventPayload`s; the manager tags them with the owning kernel
//! ID and fans them out to subscribers. Emission is synchronous on the
//! emitting task, so listeners must be short and non-blocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::KernelId;

/// Output stream name for `stream` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Error payload shared by `execute_error` events and failed outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteErrorPayload {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ExecuteErrorPayload {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }
}

/// Mime-bundle payload shared by display and result events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayPayload {
    /// Mime type to representation
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
}

impl DisplayPayload {
    /// Single text/plain representation
    pub fn text(text: impl Into<String>) -> Self {
        let mut data = HashMap::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        Self {
            data,
            ..Default::default()
        }
    }
}

/// Typed event payload, tagged with its kind on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData(DisplayPayload),
    UpdateDisplayData(DisplayPayload),
    ExecuteResult(DisplayPayload),
    ExecuteError(ExecuteErrorPayload),
    InputRequest {
        prompt: String,
        password: bool,
    },
    ClearOutput {
        wait: bool,
    },
    /// Opaque pass-through for engines that implement comms
    CommOpen(Value),
    CommMsg(Value),
    CommClose(Value),
    /// Watchdog report: an execution exceeded its configured deadline
    ExecutionStalled {
        execution_id: String,
        max_execution_time_ms: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Stream { .. } => EventKind::Stream,
            EventPayload::DisplayData(_) => EventKind::DisplayData,
            EventPayload::UpdateDisplayData(_) => EventKind::UpdateDisplayData,
            EventPayload::ExecuteResult(_) => EventKind::ExecuteResult,
            EventPayload::ExecuteError(_) => EventKind::ExecuteError,
            EventPayload::InputRequest { .. } => EventKind::InputRequest,
            EventPayload::ClearOutput { .. } => EventKind::ClearOutput,
            EventPayload::CommOpen(_) => EventKind::CommOpen,
            EventPayload::CommMsg(_) => EventKind::CommMsg,
            EventPayload::CommClose(_) => EventKind::CommClose,
            EventPayload::ExecutionStalled { .. } => EventKind::ExecutionStalled,
        }
    }
}

/// Discriminant of `EventPayload`, used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stream,
    DisplayData,
    UpdateDisplayData,
    ExecuteResult,
    ExecuteError,
    InputRequest,
    ClearOutput,
    CommOpen,
    CommMsg,
    CommClose,
    ExecutionStalled,
}

impl EventKind {
    /// All defined kinds, in taxonomy order
    pub const ALL: [EventKind; 11] = [
        EventKind::Stream,
        EventKind::DisplayData,
        EventKind::UpdateDisplayData,
        EventKind::ExecuteResult,
        EventKind::ExecuteError,
        EventKind::InputRequest,
        EventKind::ClearOutput,
        EventKind::CommOpen,
        EventKind::CommMsg,
        EventKind::CommClose,
        EventKind::ExecutionStalled,
    ];
}

/// An event as observed by subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub kernel_id: KernelId,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl KernelEvent {
    pub fn new(kernel_id: KernelId, payload: EventPayload) -> Self {
        Self { kernel_id, payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Listener callback invoked on the emitter's task
pub type EventListener = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

/// Handle returned by subscription calls; pass back to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    listener: EventListener,
}

#[derive(Default)]
struct BusState {
    /// Kernel-scoped listeners keyed by (kernel, kind)
    by_kernel: HashMap<KernelId, HashMap<EventKind, Vec<Registration>>>,
    /// Firehose listeners keyed by kind only
    by_kind: HashMap<EventKind, Vec<Registration>>,
    /// Reverse index for O(1) unsubscribe
    locations: HashMap<SubscriptionId, (Option<KernelId>, EventKind)>,
}

/// Per-manager event emitter with kernel-scoped and firehose registration
///
/// Listener wrappers are tracked per kernel so that destroying a kernel can
/// revoke all of its subscriptions in one call. Re-entrant emission from a
/// listener is supported.
pub struct EventBus {
    state: RwLock<BusState>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BusState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener invoked only for events of `kind` carrying
    /// `kernel_id`
    pub fn on_kernel(
        &self,
        kernel_id: KernelId,
        kind: EventKind,
        listener: EventListener,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        let mut state = self.state.write();
        state
            .by_kernel
            .entry(kernel_id.clone())
            .or_default()
            .entry(kind)
            .or_default()
            .push(Registration { id, listener });
        state.locations.insert(id, (Some(kernel_id), kind));
        id
    }

    /// Register a firehose listener invoked for every event of `kind`
    pub fn on_all(&self, kind: EventKind, listener: EventListener) -> SubscriptionId {
        let id = self.allocate_id();
        let mut state = self.state.write();
        state
            .by_kind
            .entry(kind)
            .or_default()
            .push(Registration { id, listener });
        state.locations.insert(id, (None, kind));
        id
    }

    /// Remove a single subscription. Unknown IDs are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.write();
        let Some((kernel, kind)) = state.locations.remove(&id) else {
            return;
        };
        match kernel {
            Some(kernel_id) => {
                let mut drained = false;
                if let Some(kinds) = state.by_kernel.get_mut(&kernel_id) {
                    if let Some(regs) = kinds.get_mut(&kind) {
                        regs.retain(|r| r.id != id);
                        if regs.is_empty() {
                            kinds.remove(&kind);
                        }
                    }
                    drained = kinds.is_empty();
                }
                if drained {
                    state.by_kernel.remove(&kernel_id);
                }
            }
            None => {
                if let Some(regs) = state.by_kind.get_mut(&kind) {
                    regs.retain(|r| r.id != id);
                    if regs.is_empty() {
                        state.by_kind.remove(&kind);
                    }
                }
            }
        }
    }

    /// Drop every kernel-scoped listener for `kernel_id`. O(listeners).
    pub fn remove_kernel_listeners(&self, kernel_id: &KernelId) {
        let mut state = self.state.write();
        if let Some(kinds) = state.by_kernel.remove(kernel_id) {
            for regs in kinds.values() {
                for reg in regs {
                    state.locations.remove(&reg.id);
                }
            }
        }
    }

    /// Number of live subscriptions attributable to `kernel_id`. Used by
    /// leak-check tests.
    pub fn kernel_listener_count(&self, kernel_id: &KernelId) -> usize {
        self.state
            .read()
            .by_kernel
            .get(kernel_id)
            .map(|kinds| kinds.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Deliver an event to every matching listener, in registration order
    /// (kernel-scoped before firehose). Listener callbacks run synchronously
    /// on the calling task.
    pub fn emit(&self, event: &KernelEvent) {
        let kind = event.kind();
        // Snapshot matching listeners so callbacks may re-enter the bus.
        let listeners: Vec<EventListener> = {
            let state = self.state.read();
            let scoped = state
                .by_kernel
                .get(&event.kernel_id)
                .and_then(|kinds| kinds.get(&kind))
                .into_iter()
                .flatten();
            let firehose = state.by_kind.get(&kind).into_iter().flatten();
            scoped
                .chain(firehose)
                .map(|r| Arc::clone(&r.listener))
                .collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
