//! Kernel manager façade
//!
//! The public surface of the crate: create, destroy, list, execute, stream,
//! interrupt, restart. Owns the kernel table, the event bus, the activity
//! tracker, and the warm pool, and wires them together.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{KernelHubError, Result};

use super::activity::ActivityTracker;
use super::config::{ManagerConfig, WorkerConfig};
use super::engine::{
    EngineContext, EngineRegistry, EngineStatus, EventSink, ExecutionOutcome, InterruptFlag,
    KernelEngine,
};
use super::event::{
    EventBus, EventKind, EventPayload, ExecuteErrorPayload, KernelEvent,
};
use super::pool::{KernelPool, PreparedKernel};
use super::stream::{self, ExecuteStream, ExecuteStreamItem, StreamSettings};
use super::types::{
    ExecutionInfo, KernelId, KernelInfo, KernelLanguage, KernelMode, KernelOptions, KernelSummary,
    NAMESPACE_SEPARATOR,
};
use super::worker::{WorkerEngine, WorkerHandle, WorkerInitOptions};

/// A live kernel owned by the manager
pub struct KernelInstance {
    pub id: KernelId,
    pub mode: KernelMode,
    pub language: KernelLanguage,
    pub engine: Arc<dyn KernelEngine>,
    pub worker: Option<Arc<WorkerHandle>>,
    pub created: DateTime<Utc>,
    pub from_pool: bool,
    options: RwLock<KernelOptions>,
    id_cell: Arc<RwLock<KernelId>>,
    interrupt: InterruptFlag,
    destroyed: AtomicBool,
}

impl KernelInstance {
    /// Snapshot of the creation options (plus any later timeout updates)
    pub fn options(&self) -> KernelOptions {
        self.options.read().clone()
    }

    /// Identity currently bound to the kernel's event path. Matches `id`
    /// from the moment the instance is registered.
    pub fn event_identity(&self) -> KernelId {
        self.id_cell.read().clone()
    }

    /// Release the worker, interrupt flag, and event tagging. Idempotent.
    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.interrupt.clear();
        if let Some(worker) = &self.worker {
            worker.terminate().await;
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    bus: Arc<EventBus>,
    tracker: ActivityTracker,
    pool: Arc<KernelPool>,
    registry: Arc<EngineRegistry>,
    kernels: RwLock<HashMap<KernelId, Arc<KernelInstance>>>,
    /// IDs with a creation in flight, so concurrent duplicates are rejected
    /// before the table is touched
    reserved: Mutex<HashSet<KernelId>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-tenant kernel orchestrator
///
/// Cheap to clone; all clones share one kernel table, pool, and event bus.
#[derive(Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl KernelManager {
    /// Manager with the default engine registry (echo engines)
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, Arc::new(EngineRegistry::with_defaults()))
    }

    /// Manager with embedder-supplied engines
    pub fn with_registry(config: ManagerConfig, registry: Arc<EngineRegistry>) -> Self {
        let bus = Arc::new(EventBus::new());
        let (tracker, mut evictions) = ActivityTracker::new(bus.clone());

        // Surface watchdog stalls as synthetic execute errors. Weak, so the
        // bus does not keep itself alive through its own listener.
        let weak_bus = Arc::downgrade(&bus);
        bus.on_all(
            EventKind::ExecutionStalled,
            Arc::new(move |event| {
                let EventPayload::ExecutionStalled {
                    execution_id,
                    max_execution_time_ms,
                } = &event.payload
                else {
                    return;
                };
                if let Some(bus) = weak_bus.upgrade() {
                    bus.emit(&KernelEvent::new(
                        event.kernel_id.clone(),
                        EventPayload::ExecuteError(ExecuteErrorPayload::new(
                            "ExecutionStalled",
                            format!(
                                "execution {} exceeded {}ms",
                                execution_id, max_execution_time_ms
                            ),
                        )),
                    ));
                }
            }),
        );

        let pool = {
            let worker_config = config.worker.clone();
            let registry = registry.clone();
            let bus = bus.clone();
            KernelPool::new(
                config.pool.clone(),
                Arc::new(move |mode, language| {
                    let worker_config = worker_config.clone();
                    let registry = registry.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        build_kernel(
                            &worker_config,
                            &registry,
                            bus,
                            mode,
                            language,
                            &KernelOptions::default(),
                            KernelId::pool_temporary(),
                        )
                        .await
                    })
                }),
            )
        };

        let inner = Arc::new(ManagerInner {
            config,
            bus,
            tracker,
            pool: pool.clone(),
            registry,
            kernels: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            reaper: Mutex::new(None),
        });

        // Inactivity evictions arrive on a channel; destroying is the
        // manager's job, done here so timers never hold the manager alive.
        let weak = Arc::downgrade(&inner);
        let reaper = tokio::spawn(async move {
            while let Some(kernel_id) = evictions.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                info!(kernel = %kernel_id, "destroying kernel after inactivity timeout");
                if let Err(err) = inner.destroy(&kernel_id).await {
                    debug!(kernel = %kernel_id, error = %err, "eviction raced a destroy");
                }
            }
        });
        *inner.reaper.lock() = Some(reaper);

        pool.prefill();

        Self { inner }
    }

    /// The manager's event bus, for subscriber registration
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &ActivityTracker {
        &self.inner.tracker
    }

    /// Engine registry, for language registration by embedders
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.inner.registry
    }

    /// Warm pool handle, exposed for observability
    pub fn pool(&self) -> &Arc<KernelPool> {
        &self.inner.pool
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a kernel and return its namespaced ID
    ///
    /// The instance is observable through `list`/`get_info` only once it is
    /// fully initialized; pool-temporary IDs never appear.
    pub async fn create(&self, options: KernelOptions) -> Result<KernelId> {
        if let Some(base) = &options.id {
            if base.contains(NAMESPACE_SEPARATOR) {
                return Err(KernelHubError::InvalidKernelId {
                    id: base.clone(),
                    reason: format!("the {:?} separator is reserved", NAMESPACE_SEPARATOR),
                });
            }
        }
        if !self
            .inner
            .config
            .is_allowed(options.mode, &options.language)
        {
            return Err(KernelHubError::KernelTypeNotAllowed {
                mode: options.mode.to_string(),
                language: options.language.to_string(),
            });
        }

        let base = options
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kernel_id = KernelId::new(options.namespace.as_deref(), &base);

        // Reserve the ID across the whole (possibly slow) creation.
        {
            let kernels = self.inner.kernels.read();
            let mut reserved = self.inner.reserved.lock();
            if kernels.contains_key(&kernel_id) || !reserved.insert(kernel_id.clone()) {
                return Err(KernelHubError::DuplicateKernel {
                    id: kernel_id.to_string(),
                });
            }
        }

        let result = self.inner.create_registered(&kernel_id, options).await;
        self.inner.reserved.lock().remove(&kernel_id);

        match result {
            Ok(()) => {
                debug!(kernel = %kernel_id, "kernel created");
                Ok(kernel_id)
            }
            Err(err) => {
                // No direct subscriber may be waiting yet; announce the
                // failure on the requested ID as well.
                self.inner.emit_synthetic_error(
                    &kernel_id,
                    "KernelSetupError",
                    &err.to_string(),
                );
                Err(KernelHubError::KernelSetupError {
                    id: kernel_id.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Destroy a kernel: cancel its timers, drop its listeners, release its
    /// worker and interrupt flag, and remove the entry. A second call fails
    /// with `KernelNotFound`; resources are released exactly once.
    pub async fn destroy(&self, kernel_id: &KernelId) -> Result<()> {
        self.inner.destroy(kernel_id).await
    }

    /// Concurrently destroy every kernel in `namespace`; with no namespace,
    /// destroy everything and drain the pool. Returns the number destroyed.
    pub async fn destroy_all(&self, namespace: Option<&str>) -> Result<usize> {
        let ids: Vec<KernelId> = {
            let kernels = self.inner.kernels.read();
            kernels
                .keys()
                .filter(|id| id.in_namespace(namespace))
                .cloned()
                .collect()
        };
        let destroyed = join_all(ids.iter().map(|id| self.inner.destroy(id)))
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        if namespace.is_none() {
            self.inner.pool.drain().await;
        }
        Ok(destroyed)
    }

    /// Destroy everything, drain the pool, and stop background tasks. The
    /// manager is unusable afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.destroy_all(None).await?;
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        Ok(())
    }

    /// Summaries of live kernels, filtered by namespace. Pool-temporary
    /// kernels are never listed.
    pub fn list(&self, namespace: Option<&str>) -> Vec<KernelSummary> {
        let kernels = self.inner.kernels.read();
        let mut summaries: Vec<KernelSummary> = kernels
            .values()
            .filter(|instance| !instance.id.is_pool_temporary())
            .filter(|instance| instance.id.in_namespace(namespace))
            .map(|instance| self.summarize(instance))
            .collect();
        summaries.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        summaries
    }

    /// Extended info for one kernel, including live execution statistics
    pub fn get_info(&self, kernel_id: &KernelId) -> Result<KernelInfo> {
        let instance = self.inner.get(kernel_id)?;
        Ok(KernelInfo {
            summary: self.summarize(&instance),
            execution: self.inner.tracker.execution_info(kernel_id),
        })
    }

    /// Engine status for one kernel
    pub fn status(&self, kernel_id: &KernelId) -> Result<EngineStatus> {
        Ok(self.inner.get(kernel_id)?.engine.status())
    }

    /// Live execution statistics for one kernel
    pub fn execution_info(&self, kernel_id: &KernelId) -> Result<ExecutionInfo> {
        self.inner.get(kernel_id)?;
        Ok(self.inner.tracker.execution_info(kernel_id))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run code to completion and return the settled outcome. Activity is
    /// touched on start and end; execution tracking always ends, even when
    /// the engine errors.
    pub async fn execute(
        &self,
        kernel_id: &KernelId,
        code: &str,
        parent: Option<Value>,
    ) -> Result<ExecutionOutcome> {
        let instance = self.inner.get(kernel_id)?;
        let execution_id = self
            .inner
            .tracker
            .begin_execution(kernel_id)
            .ok_or_else(|| KernelHubError::KernelNotFound {
                id: kernel_id.to_string(),
            })?;
        let _guard = EndExecution {
            tracker: &self.inner.tracker,
            kernel_id,
            execution_id,
        };

        match instance.engine.execute(code, parent).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if matches!(err, KernelHubError::WorkerCrashed { .. }) => {
                warn!(kernel = %kernel_id, "worker crashed, reaping kernel");
                self.inner.emit_synthetic_error(kernel_id, "WorkerCrashed", &err.to_string());
                let _ = self.inner.destroy(kernel_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Run code and observe its events as a finite async sequence, ended by
    /// exactly one terminal item (the settled outcome, or a failure such as
    /// the bounded-wait timeout).
    ///
    /// Events are buffered per stream; a paused consumer never stalls the
    /// emitter, and past the configured cap further events are dropped with
    /// a warning. Dropping the stream detaches its listeners and ends
    /// execution tracking.
    pub fn execute_stream(
        &self,
        kernel_id: &KernelId,
        code: &str,
        parent: Option<Value>,
    ) -> ExecuteStream {
        let instance = match self.inner.get(kernel_id) {
            Ok(instance) => instance,
            Err(err) => return failed_stream(err),
        };
        let Some(execution_id) = self.inner.tracker.begin_execution(kernel_id) else {
            return failed_stream(KernelHubError::KernelNotFound {
                id: kernel_id.to_string(),
            });
        };

        let tracker = self.inner.tracker.clone();
        let cleanup_id = kernel_id.clone();
        let cleanup = move || tracker.end_execution(&cleanup_id, &execution_id);

        let engine = instance.engine.clone();
        let code = code.to_string();
        let start = move || {
            tokio::spawn(async move { engine.execute(&code, parent).await })
        };

        stream::bridge(
            self.inner.bus.clone(),
            kernel_id.clone(),
            start,
            StreamSettings {
                timeout: Duration::from_millis(self.inner.config.stream_timeout_ms),
                buffer_cap: self.inner.config.stream_buffer_cap,
            },
            cleanup,
        )
    }

    /// Best-effort cancellation. Returns whether a running execution was
    /// signaled.
    pub async fn interrupt(&self, kernel_id: &KernelId) -> Result<bool> {
        let instance = self.inner.get(kernel_id)?;
        self.inner.tracker.touch(kernel_id);
        // Raise the shared flag first: in-process engines observe it at
        // their next check point even before the call below lands.
        instance.interrupt.trigger();
        Ok(instance.engine.interrupt().await)
    }

    /// Destroy and recreate under the same ID with the same options. Engine
    /// state is reset; `created` is fresh.
    pub async fn restart(&self, kernel_id: &KernelId) -> Result<bool> {
        let instance = self.inner.get(kernel_id)?;
        let mut options = instance.options();
        options.id = Some(kernel_id.base().to_string());
        options.namespace = kernel_id.namespace().map(str::to_string);

        self.inner.destroy(kernel_id).await?;
        let recreated = self.create(options).await?;
        if &recreated != kernel_id {
            return Err(KernelHubError::RestartIdMismatch {
                id: kernel_id.to_string(),
                recreated: recreated.to_string(),
            });
        }
        Ok(true)
    }

    /// Reset the inactivity timer without any other effect. Returns whether
    /// the kernel exists.
    pub fn ping(&self, kernel_id: &KernelId) -> bool {
        if self.inner.kernels.read().contains_key(kernel_id) {
            self.inner.tracker.touch(kernel_id);
            true
        } else {
            false
        }
    }

    /// Update the inactivity timeout and re-arm (or cancel, with 0) the timer
    pub fn set_inactivity_timeout(&self, kernel_id: &KernelId, timeout_ms: u64) -> Result<()> {
        let instance = self.inner.get(kernel_id)?;
        instance.options.write().inactivity_timeout_ms = timeout_ms;
        self.inner
            .tracker
            .set_inactivity_timeout(kernel_id, timeout_ms);
        Ok(())
    }

    /// Embedder-initiated kill: announce a synthetic error, then destroy
    pub async fn force_terminate(&self, kernel_id: &KernelId, reason: &str) -> Result<()> {
        self.inner.get(kernel_id)?;
        warn!(kernel = %kernel_id, reason, "force-terminating kernel");
        self.inner
            .emit_synthetic_error(kernel_id, "KernelForcedTermination", reason);
        self.inner.destroy(kernel_id).await
    }

    /// Forward a reply to a pending `input_request`
    pub async fn input_reply(&self, kernel_id: &KernelId, value: String) -> Result<()> {
        let instance = self.inner.get(kernel_id)?;
        self.inner.tracker.touch(kernel_id);
        instance.engine.input_reply(value).await
    }

    fn summarize(&self, instance: &KernelInstance) -> KernelSummary {
        KernelSummary {
            id: instance.id.clone(),
            mode: instance.mode,
            language: instance.language.clone(),
            created: instance.created,
            namespace: instance.id.namespace().map(str::to_string),
            from_pool: instance.from_pool,
        }
    }
}

impl ManagerInner {
    fn get(&self, kernel_id: &KernelId) -> Result<Arc<KernelInstance>> {
        self.kernels
            .read()
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| KernelHubError::KernelNotFound {
                id: kernel_id.to_string(),
            })
    }

    fn emit_synthetic_error(&self, kernel_id: &KernelId, ename: &str, evalue: &str) {
        self.bus.emit(&KernelEvent::new(
            kernel_id.clone(),
            EventPayload::ExecuteError(ExecuteErrorPayload::new(ename, evalue)),
        ));
    }

    /// Obtain a prepared kernel (warm or on-demand), retag it, and register
    /// it. The table is only touched once the kernel is fully initialized.
    async fn create_registered(&self, kernel_id: &KernelId, options: KernelOptions) -> Result<()> {
        let pool_eligible = options.is_pool_eligible()
            && self.config.is_preloaded(options.mode, &options.language);

        let mut from_pool = false;
        let prepared = if pool_eligible {
            match self.pool.take(options.mode, &options.language) {
                Some(pending) => {
                    from_pool = true;
                    Some(pending.wait().await?)
                }
                // Pool empty: fall through to on-demand. The take already
                // scheduled a background refill.
                None => None,
            }
        } else {
            None
        };

        let prepared = match prepared {
            Some(prepared) => prepared,
            None => {
                build_kernel(
                    &self.config.worker,
                    &self.registry,
                    self.bus.clone(),
                    options.mode,
                    options.language.clone(),
                    &options,
                    kernel_id.clone(),
                )
                .await?
            }
        };

        if from_pool {
            // Rebind the event channel from the temporary pool identity.
            prepared.retag(kernel_id.clone());
        }

        let PreparedKernel {
            engine,
            worker,
            id_cell,
            interrupt,
            created,
        } = prepared;

        let instance = Arc::new(KernelInstance {
            id: kernel_id.clone(),
            mode: options.mode,
            language: options.language.clone(),
            engine,
            worker,
            created,
            from_pool,
            options: RwLock::new(options.clone()),
            id_cell,
            interrupt,
            destroyed: AtomicBool::new(false),
        });

        self.kernels.write().insert(kernel_id.clone(), instance);
        self.tracker.register(
            kernel_id.clone(),
            options.inactivity_timeout_ms,
            options.max_execution_time_ms,
        );
        Ok(())
    }

    async fn destroy(&self, kernel_id: &KernelId) -> Result<()> {
        let instance = self.kernels.write().remove(kernel_id).ok_or_else(|| {
            KernelHubError::KernelNotFound {
                id: kernel_id.to_string(),
            }
        })?;
        self.tracker.remove(kernel_id);
        self.bus.remove_kernel_listeners(kernel_id);
        instance.destroy().await;
        debug!(kernel = %kernel_id, "kernel destroyed");
        Ok(())
    }
}

/// Ends execution tracking when the scope exits, error paths included
struct EndExecution<'a> {
    tracker: &'a ActivityTracker,
    kernel_id: &'a KernelId,
    execution_id: String,
}

impl Drop for EndExecution<'_> {
    fn drop(&mut self) {
        self.tracker.end_execution(self.kernel_id, &self.execution_id);
    }
}

/// Stream that yields a single terminal failure
fn failed_stream(err: KernelHubError) -> ExecuteStream {
    Box::pin(futures::stream::iter([ExecuteStreamItem::Failed(err)]))
}

/// Build and initialize a kernel in either scheduling mode. The `id_cell`
/// created here is the single identity source for the kernel's event path.
async fn build_kernel(
    worker_config: &WorkerConfig,
    registry: &Arc<EngineRegistry>,
    bus: Arc<EventBus>,
    mode: KernelMode,
    language: KernelLanguage,
    options: &KernelOptions,
    initial_id: KernelId,
) -> Result<PreparedKernel> {
    let id_cell = Arc::new(RwLock::new(initial_id));
    let interrupt = InterruptFlag::new();

    match mode {
        KernelMode::InProcess => {
            let engine = registry.create_engine(&language)?;
            let sink_cell = id_cell.clone();
            let sink = EventSink::new(move |payload| {
                let kernel_id = sink_cell.read().clone();
                bus.emit(&KernelEvent::new(kernel_id, payload));
            });
            let mut ctx = EngineContext::new(sink, interrupt.clone());
            ctx.environment = options.environment.clone();
            ctx.filesystem = options.filesystem.clone();
            engine.initialize(ctx).await?;
            Ok(PreparedKernel {
                engine,
                worker: None,
                id_cell,
                interrupt,
                created: Utc::now(),
            })
        }
        KernelMode::Worker => {
            let init = WorkerInitOptions {
                language,
                environment: options.environment.clone(),
                filesystem: options.filesystem.clone(),
                permissions: options.permissions.clone(),
            };
            let handle =
                WorkerHandle::spawn(worker_config, init, bus, id_cell.clone()).await?;
            Ok(PreparedKernel {
                engine: Arc::new(WorkerEngine::new(handle.clone())),
                worker: Some(handle),
                id_cell,
                interrupt,
                created: Utc::now(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::config::KernelTypeSpec;

    fn in_process_config() -> ManagerConfig {
        ManagerConfig {
            allowed_kernel_types: vec![
                KernelTypeSpec::new(KernelMode::InProcess, KernelLanguage::Python),
                KernelTypeSpec::new(KernelMode::InProcess, KernelLanguage::TypeScript),
            ],
            ..Default::default()
        }
    }

    fn in_process_options(id: &str) -> KernelOptions {
        KernelOptions {
            id: Some(id.to_string()),
            mode: KernelMode::InProcess,
            language: KernelLanguage::Python,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let manager = KernelManager::new(in_process_config());
        let id = manager.create(in_process_options("a")).await.unwrap();
        assert_eq!(id.as_str(), "a");

        let listed = manager.list(None);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(!listed[0].from_pool);
        assert_eq!(manager.status(&id).unwrap(), EngineStatus::Active);
    }

    #[tokio::test]
    async fn test_reserved_separator_rejected() {
        let manager = KernelManager::new(in_process_config());
        let err = manager
            .create(in_process_options("bad:id"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelHubError::InvalidKernelId { .. }));
        assert!(manager.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let manager = KernelManager::new(in_process_config());
        manager.create(in_process_options("dup")).await.unwrap();
        let err = manager
            .create(in_process_options("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelHubError::DuplicateKernel { .. }));
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let manager = KernelManager::new(in_process_config());
        for (ns, base) in [("alpha", "k1"), ("alpha", "k2"), ("beta", "k1")] {
            let mut options = in_process_options(base);
            options.namespace = Some(ns.to_string());
            manager.create(options).await.unwrap();
        }

        assert_eq!(manager.list(Some("alpha")).len(), 2);
        assert_eq!(manager.list(Some("beta")).len(), 1);
        assert_eq!(manager.list(None).len(), 3);

        assert_eq!(manager.destroy_all(Some("alpha")).await.unwrap(), 2);
        assert_eq!(manager.list(None).len(), 1);
        assert_eq!(manager.list(Some("beta")).len(), 1);
    }

    #[tokio::test]
    async fn test_execute_returns_outcome() {
        let manager = KernelManager::new(in_process_config());
        let id = manager.create(in_process_options("exec")).await.unwrap();

        let outcome = manager
            .execute(&id, "print:hi\nresult:99", None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(Value::String("99".to_string())));
        assert_eq!(manager.execution_info(&id).unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_destroy_is_terminal_and_reports_not_found() {
        let manager = KernelManager::new(in_process_config());
        let id = manager.create(in_process_options("gone")).await.unwrap();
        manager.destroy(&id).await.unwrap();

        let err = manager.destroy(&id).await.unwrap_err();
        assert!(matches!(err, KernelHubError::KernelNotFound { .. }));
        // The ID is free for reuse afterwards.
        manager.create(in_process_options("gone")).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_preserves_identity() {
        let manager = KernelManager::new(in_process_config());
        let mut options = in_process_options("phoenix");
        options.namespace = Some("ns".to_string());
        let id = manager.create(options).await.unwrap();
        let before = manager.get_info(&id).unwrap();

        // Accumulate engine state, then restart.
        manager.execute(&id, "result:1", None).await.unwrap();
        assert!(manager.restart(&id).await.unwrap());

        let after = manager.get_info(&id).unwrap();
        assert_eq!(after.summary.id, before.summary.id);
        assert_eq!(after.summary.namespace, before.summary.namespace);
        assert!(after.summary.created >= before.summary.created);

        // Fresh engine: execution counter starts over.
        let outcome = manager.execute(&id, "result:2", None).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_ids() {
        let manager = KernelManager::new(in_process_config());
        let id = manager.create(in_process_options("alive")).await.unwrap();
        assert!(manager.ping(&id));
        assert!(!manager.ping(&KernelId::new(None, "missing")));

        let err = manager
            .execute(&KernelId::new(None, "missing"), "print:x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelHubError::KernelNotFound { .. }));
    }

    #[tokio::test]
    async fn test_force_terminate_emits_then_destroys() {
        let manager = KernelManager::new(in_process_config());
        let id = manager.create(in_process_options("victim")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.bus().on_kernel(
            id.clone(),
            EventKind::ExecuteError,
            Arc::new(move |event| {
                if let EventPayload::ExecuteError(err) = &event.payload {
                    seen_clone.lock().push(err.ename.clone());
                }
            }),
        );

        manager.force_terminate(&id, "operator request").await.unwrap();
        assert_eq!(*seen.lock(), vec!["KernelForcedTermination".to_string()]);
        assert!(manager.list(None).is_empty());
    }
}
