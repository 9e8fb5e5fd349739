//! Engine contract
//!
//! `KernelEngine` is the seam every executor must satisfy. The manager talks
//! to engines uniformly regardless of scheduling mode; worker-mode kernels
//! are represented by a proxy engine that forwards over the worker channel.
//!
//! `EchoEngine` is a deterministic in-repo implementation used by the demo
//! CLI, the default worker registry, and tests. Real language engines are
//! collaborators registered by the embedder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};

use crate::error::{KernelHubError, Result};

use super::event::{DisplayPayload, EventPayload, ExecuteErrorPayload, StreamName};
use super::types::{FilesystemMount, KernelLanguage};

/// Engine liveness as observed by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Initialized and idle
    Active,
    /// At least one execution in flight
    Busy,
    /// Shut down; no further operations will succeed
    Terminated,
    /// Liveness cannot be determined (not yet initialized, or an error path)
    Unknown,
}

/// Settled value of a single execute call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecuteErrorPayload>,
}

impl ExecutionOutcome {
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(error: ExecuteErrorPayload) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Where an engine delivers its events. The manager bridges the sink to the
/// event bus with the correct kernel identity; the worker runtime bridges it
/// to the outgoing message channel.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(EventPayload) + Send + Sync>,
}

impl EventSink {
    pub fn new(deliver: impl Fn(EventPayload) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Sink that discards everything. Useful for engines warmed without a
    /// subscriber yet.
    pub fn null() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, payload: EventPayload) {
        (self.deliver)(payload);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Single-byte cancellation flag shared between the manager (writer) and an
/// in-process engine (reader). One byte, one writer, one reader; no other
/// synchronization required.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicU8>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Engines observe it at their next check point.
    pub fn trigger(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Lower the flag, typically at the start of a new execution
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Everything an engine needs at initialization time
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub sink: EventSink,
    pub interrupt: InterruptFlag,
    /// Variables exposed to executed code globally
    pub environment: HashMap<String, String>,
    /// Virtual-to-host path rewrite the engine applies to its own IO
    pub filesystem: Option<FilesystemMount>,
}

impl EngineContext {
    pub fn new(sink: EventSink, interrupt: InterruptFlag) -> Self {
        Self {
            sink,
            interrupt,
            environment: HashMap::new(),
            filesystem: None,
        }
    }
}

/// Contract any executor must satisfy
///
/// Events emitted during a single execution are delivered in the order they
/// occur. Engines must not retain parent-supplied values beyond the execute
/// call.
#[async_trait]
pub trait KernelEngine: Send + Sync {
    /// Prepare the engine for execution. Idempotent; a second call is a
    /// no-op. Fails with `EngineInitError` on underlying failure.
    async fn initialize(&self, ctx: EngineContext) -> Result<()>;

    /// Run `code` to completion, emitting events through the sink along the
    /// way, and return the settled outcome
    async fn execute(&self, code: &str, parent: Option<Value>) -> Result<ExecutionOutcome>;

    /// Best-effort cancellation signal. Returns whether a running execution
    /// was signaled.
    async fn interrupt(&self) -> bool;

    fn status(&self) -> EngineStatus;

    /// Reply to a pending `input_request`. Engines without interactive input
    /// ignore replies.
    async fn input_reply(&self, _value: String) -> Result<()> {
        Ok(())
    }
}

/// Produces engines for one language; registered with the manager or the
/// worker runtime
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Arc<dyn KernelEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Arc<dyn KernelEngine> + Send + Sync,
{
    fn create(&self) -> Arc<dyn KernelEngine> {
        self()
    }
}

/// Language-keyed registry of engine factories
pub struct EngineRegistry {
    factories: RwLock<HashMap<KernelLanguage, Arc<dyn EngineFactory>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with `EchoEngine` wired for both built-in languages
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(KernelLanguage::Python, Arc::new(|| {
            Arc::new(EchoEngine::new()) as Arc<dyn KernelEngine>
        }));
        registry.register(KernelLanguage::TypeScript, Arc::new(|| {
            Arc::new(EchoEngine::new()) as Arc<dyn KernelEngine>
        }));
        registry
    }

    pub fn register(&self, language: KernelLanguage, factory: Arc<dyn EngineFactory>) {
        self.factories.write().insert(language, factory);
    }

    pub fn create_engine(&self, language: &KernelLanguage) -> Result<Arc<dyn KernelEngine>> {
        self.factories
            .read()
            .get(language)
            .map(|factory| factory.create())
            .ok_or_else(|| KernelHubError::EngineNotRegistered {
                language: language.to_string(),
            })
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// EchoEngine
// =============================================================================

/// How often a sleeping `EchoEngine` execution polls the interrupt flag
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deterministic script-driven engine
///
/// Interprets one directive per input line:
///
/// - `print:TEXT` / `eprint:TEXT` - stdout / stderr stream event
/// - `display:TEXT` / `update:TEXT` - display data and its update
/// - `result:TEXT` - execute_result event; becomes the outcome value
/// - `error:NAME:MESSAGE` - execute_error event and a failed outcome
/// - `sleep:MS` - delay, interruptible
/// - `input:PROMPT` - input_request event
/// - `clear` - clear_output
///
/// Any other non-empty line is echoed to stdout. Useful wherever a real
/// language runtime is out of reach: demos, worker defaults, tests.
pub struct EchoEngine {
    ctx: Mutex<Option<EngineContext>>,
    initialized: AtomicBool,
    busy: AtomicUsize,
    execution_count: AtomicU64,
    last_input_reply: Mutex<Option<String>>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            ctx: Mutex::new(None),
            initialized: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            execution_count: AtomicU64::new(0),
            last_input_reply: Mutex::new(None),
        }
    }

    fn context(&self) -> Result<EngineContext> {
        self.ctx
            .lock()
            .clone()
            .ok_or_else(|| KernelHubError::EngineInitError {
                reason: "engine used before initialize".to_string(),
            })
    }

    /// Most recent `input_reply` value, if any
    pub fn last_input_reply(&self) -> Option<String> {
        self.last_input_reply.lock().clone()
    }

    async fn interruptible_sleep(&self, ms: u64, interrupt: &InterruptFlag) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
        while tokio::time::Instant::now() < deadline {
            if interrupt.is_set() {
                return false;
            }
            let remaining = deadline - tokio::time::Instant::now();
            sleep(remaining.min(INTERRUPT_POLL_INTERVAL)).await;
        }
        !interrupt.is_set()
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelEngine for EchoEngine {
    async fn initialize(&self, ctx: EngineContext) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.ctx.lock() = Some(ctx);
        Ok(())
    }

    async fn execute(&self, code: &str, _parent: Option<Value>) -> Result<ExecutionOutcome> {
        let ctx = self.context()?;
        ctx.interrupt.clear();
        self.busy.fetch_add(1, Ordering::AcqRel);
        let execution_count = self.execution_count.fetch_add(1, Ordering::AcqRel) + 1;

        let outcome = self.run_script(code, &ctx, execution_count).await;

        self.busy.fetch_sub(1, Ordering::AcqRel);
        Ok(outcome)
    }

    async fn interrupt(&self) -> bool {
        let Some(ctx) = self.ctx.lock().clone() else {
            return false;
        };
        if self.busy.load(Ordering::Acquire) == 0 {
            return false;
        }
        ctx.interrupt.trigger();
        true
    }

    fn status(&self) -> EngineStatus {
        if !self.initialized.load(Ordering::Acquire) {
            return EngineStatus::Unknown;
        }
        if self.busy.load(Ordering::Acquire) > 0 {
            EngineStatus::Busy
        } else {
            EngineStatus::Active
        }
    }

    async fn input_reply(&self, value: String) -> Result<()> {
        *self.last_input_reply.lock() = Some(value);
        Ok(())
    }
}

impl EchoEngine {
    async fn run_script(
        &self,
        code: &str,
        ctx: &EngineContext,
        execution_count: u64,
    ) -> ExecutionOutcome {
        let mut result: Option<Value> = None;

        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if ctx.interrupt.is_set() {
                return self.interrupted(ctx);
            }

            match line.split_once(':') {
                Some(("print", text)) => ctx.sink.emit(EventPayload::Stream {
                    name: StreamName::Stdout,
                    text: text.to_string(),
                }),
                Some(("eprint", text)) => ctx.sink.emit(EventPayload::Stream {
                    name: StreamName::Stderr,
                    text: text.to_string(),
                }),
                Some(("display", text)) => {
                    ctx.sink
                        .emit(EventPayload::DisplayData(DisplayPayload::text(text)));
                }
                Some(("update", text)) => {
                    ctx.sink
                        .emit(EventPayload::UpdateDisplayData(DisplayPayload::text(text)));
                }
                Some(("result", text)) => {
                    let mut payload = DisplayPayload::text(text);
                    payload.execution_count = Some(execution_count);
                    ctx.sink.emit(EventPayload::ExecuteResult(payload));
                    result = Some(Value::String(text.to_string()));
                }
                Some(("error", rest)) => {
                    let (ename, evalue) = rest.split_once(':').unwrap_or((rest, ""));
                    let error = ExecuteErrorPayload::new(ename, evalue);
                    ctx.sink.emit(EventPayload::ExecuteError(error.clone()));
                    return ExecutionOutcome::failed(error);
                }
                Some(("sleep", ms)) => {
                    let ms = ms.parse::<u64>().unwrap_or(0);
                    if !self.interruptible_sleep(ms, &ctx.interrupt).await {
                        return self.interrupted(ctx);
                    }
                }
                Some(("input", prompt)) => ctx.sink.emit(EventPayload::InputRequest {
                    prompt: prompt.to_string(),
                    password: false,
                }),
                _ if line == "clear" => {
                    ctx.sink.emit(EventPayload::ClearOutput { wait: false });
                }
                _ => ctx.sink.emit(EventPayload::Stream {
                    name: StreamName::Stdout,
                    text: line.to_string(),
                }),
            }
        }

        ExecutionOutcome::ok(result)
    }

    fn interrupted(&self, ctx: &EngineContext) -> ExecutionOutcome {
        let error = ExecuteErrorPayload::new("ExecutionInterrupted", "execution was interrupted");
        ctx.sink.emit(EventPayload::ExecuteError(error.clone()));
        ctx.interrupt.clear();
        ExecutionOutcome::failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_ctx() -> (EngineContext, Arc<Mutex<Vec<EventPayload>>>) {
        let events: Arc<Mutex<Vec<EventPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sink = EventSink::new(move |payload| events_clone.lock().push(payload));
        (EngineContext::new(sink, InterruptFlag::new()), events)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let engine = EchoEngine::new();
        let (ctx, _) = collecting_ctx();
        assert_eq!(engine.status(), EngineStatus::Unknown);
        engine.initialize(ctx.clone()).await.unwrap();
        engine.initialize(ctx).await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Active);
    }

    #[tokio::test]
    async fn test_script_event_order() {
        let engine = EchoEngine::new();
        let (ctx, events) = collecting_ctx();
        engine.initialize(ctx).await.unwrap();

        let outcome = engine
            .execute("print:a\ndisplay:b\nprint:c\nresult:d", None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(Value::String("d".to_string())));

        let kinds: Vec<_> = events.lock().iter().map(EventPayload::kind).collect();
        assert_eq!(
            kinds,
            vec![
                super::super::event::EventKind::Stream,
                super::super::event::EventKind::DisplayData,
                super::super::event::EventKind::Stream,
                super::super::event::EventKind::ExecuteResult,
            ]
        );
    }

    #[tokio::test]
    async fn test_error_directive_fails_outcome() {
        let engine = EchoEngine::new();
        let (ctx, events) = collecting_ctx();
        engine.initialize(ctx).await.unwrap();

        let outcome = engine
            .execute("print:before\nerror:ValueError:bad input\nprint:after", None)
            .await
            .unwrap();
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.ename, "ValueError");
        assert_eq!(error.evalue, "bad input");
        // Nothing after the error line runs.
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_during_sleep() {
        let engine = Arc::new(EchoEngine::new());
        let (ctx, _) = collecting_ctx();
        engine.initialize(ctx).await.unwrap();

        let exec = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("sleep:5000", None).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.status(), EngineStatus::Busy);
        assert!(engine.interrupt().await);

        let outcome = exec.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().ename, "ExecutionInterrupted");
        assert_eq!(engine.status(), EngineStatus::Active);
    }

    #[tokio::test]
    async fn test_input_request_and_reply() {
        let engine = EchoEngine::new();
        let (ctx, events) = collecting_ctx();
        engine.initialize(ctx).await.unwrap();

        engine.execute("input:your name?", None).await.unwrap();
        assert!(matches!(
            events.lock().as_slice(),
            [EventPayload::InputRequest { password: false, .. }]
        ));

        engine.input_reply("ada".to_string()).await.unwrap();
        assert_eq!(engine.last_input_reply(), Some("ada".to_string()));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = EngineRegistry::with_defaults();
        assert!(registry.create_engine(&KernelLanguage::Python).is_ok());
        assert!(registry.create_engine(&KernelLanguage::TypeScript).is_ok());
        let err = match registry.create_engine(&KernelLanguage::Other("lua".to_string())) {
            Ok(_) => panic!("expected EngineNotRegistered error"),
            Err(e) => e,
        };
        assert!(matches!(err, KernelHubError::EngineNotRegistered { .. }));
    }
}
