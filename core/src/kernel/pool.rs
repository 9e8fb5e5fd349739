//! Warm kernel pool
//!
//! Each (mode, language) key holds a FIFO queue of pending creations, so a
//! caller arriving during pre-warming receives the in-flight creation instead
//! of starting a new one. Take is O(1); refill runs creations in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{KernelHubError, Result};

use super::config::{KernelTypeSpec, PoolConfig};
use super::engine::{InterruptFlag, KernelEngine};
use super::types::{KernelId, KernelLanguage, KernelMode};
use super::worker::WorkerHandle;

/// A fully-initialized kernel that has not yet been registered with the
/// manager. Pool entries resolve to this; on-demand creations produce it
/// directly.
pub struct PreparedKernel {
    pub engine: Arc<dyn KernelEngine>,
    pub worker: Option<Arc<WorkerHandle>>,
    /// Identity cell the event path tags events with; retagged at take time
    pub id_cell: Arc<RwLock<KernelId>>,
    pub interrupt: InterruptFlag,
    pub created: DateTime<Utc>,
}

impl PreparedKernel {
    pub fn current_id(&self) -> KernelId {
        self.id_cell.read().clone()
    }

    /// Rebind the event channel: all subsequent events carry `id`
    pub fn retag(&self, id: KernelId) {
        *self.id_cell.write() = id;
    }

    /// Release the kernel without registering it (pool eviction, drain)
    pub async fn dispose(self) {
        if let Some(worker) = self.worker {
            worker.terminate().await;
        }
    }
}

/// Creation routine supplied by the manager; the pool never knows how
/// kernels are built
pub type KernelCreator = Arc<
    dyn Fn(KernelMode, KernelLanguage) -> BoxFuture<'static, Result<PreparedKernel>>
        + Send
        + Sync,
>;

/// An in-flight kernel creation held by a pool queue
pub struct PendingKernel {
    seq: u64,
    handle: JoinHandle<Result<PreparedKernel>>,
}

impl PendingKernel {
    /// Await the creation this entry represents
    pub async fn wait(self) -> Result<PreparedKernel> {
        match self.handle.await {
            Ok(result) => result,
            Err(join) => Err(KernelHubError::KernelSetupError {
                id: "<pool>".to_string(),
                reason: format!("pooled creation task failed: {}", join),
            }),
        }
    }
}

#[derive(Default)]
struct PoolState {
    queues: HashMap<KernelTypeSpec, VecDeque<PendingKernel>>,
    draining: bool,
}

/// Promise-holding warm pool keyed by (mode, language)
pub struct KernelPool {
    config: PoolConfig,
    creator: KernelCreator,
    state: Mutex<PoolState>,
    next_seq: AtomicU64,
}

impl KernelPool {
    pub fn new(config: PoolConfig, creator: KernelCreator) -> Arc<Self> {
        Arc::new(Self {
            config,
            creator,
            state: Mutex::new(PoolState::default()),
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Top up every preloaded key. Called once at manager startup.
    pub fn prefill(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        for spec in self.config.preload_configs.clone() {
            self.refill(spec);
        }
    }

    /// FIFO pop of a pending creation. Schedules a background refill when
    /// auto-refill is on.
    pub fn take(self: &Arc<Self>, mode: KernelMode, language: &KernelLanguage) -> Option<PendingKernel> {
        if !self.config.enabled {
            return None;
        }
        let key = KernelTypeSpec::new(mode, language.clone());
        let taken = {
            let mut state = self.state.lock();
            if state.draining {
                return None;
            }
            state.queues.get_mut(&key).and_then(VecDeque::pop_front)
        };
        if self.config.auto_refill {
            self.schedule_refill(key);
        }
        taken
    }

    /// Schedule a refill on a background task
    pub fn schedule_refill(self: &Arc<Self>, key: KernelTypeSpec) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.refill(key);
        });
    }

    /// Top the queue for `key` up to the configured size with parallel
    /// creations. Queue entries are pushed under the pool lock, so
    /// overlapping refills never overshoot.
    pub fn refill(self: &Arc<Self>, key: KernelTypeSpec) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock();
        if state.draining {
            return;
        }
        let queue = state.queues.entry(key.clone()).or_default();
        while queue.len() < self.config.pool_size {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let creator = Arc::clone(&self.creator);
            let weak = Arc::downgrade(self);
            let spec = key.clone();
            let handle = tokio::spawn(async move {
                let result = creator(spec.mode, spec.language.clone()).await;
                if let Err(ref err) = result {
                    warn!(key = %spec, error = %err, "pooled kernel creation failed");
                    // Failed pendings must not linger for a future take.
                    if let Some(pool) = weak.upgrade() {
                        pool.remove_pending(&spec, seq);
                    }
                } else {
                    debug!(key = %spec, "pooled kernel ready");
                }
                result
            });
            queue.push_back(PendingKernel { seq, handle });
        }
    }

    fn remove_pending(&self, key: &KernelTypeSpec, seq: u64) {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(key) {
            queue.retain(|pending| pending.seq != seq);
        }
    }

    /// Destroy any entries beyond the configured size for `key`
    pub fn evict_excess(self: &Arc<Self>, key: &KernelTypeSpec) {
        let excess: Vec<PendingKernel> = {
            let mut state = self.state.lock();
            let Some(queue) = state.queues.get_mut(key) else {
                return;
            };
            let mut extra = Vec::new();
            while queue.len() > self.config.pool_size {
                if let Some(pending) = queue.pop_back() {
                    extra.push(pending);
                }
            }
            extra
        };
        for pending in excess {
            tokio::spawn(async move {
                if let Ok(prepared) = pending.wait().await {
                    prepared.dispose().await;
                }
            });
        }
    }

    /// Await every pending creation and destroy the result. Used on manager
    /// shutdown; the pool refuses new work afterwards.
    pub async fn drain(self: &Arc<Self>) {
        let entries: Vec<PendingKernel> = {
            let mut state = self.state.lock();
            state.draining = true;
            state
                .queues
                .drain()
                .flat_map(|(_, queue)| queue.into_iter())
                .collect()
        };
        for pending in entries {
            if let Ok(prepared) = pending.wait().await {
                prepared.dispose().await;
            }
        }
    }

    /// Allow takes again after a drain (used by restart-heavy embedders)
    pub fn reopen(&self) {
        self.state.lock().draining = false;
    }

    /// Current queue length for a key
    pub fn pending_count(&self, mode: KernelMode, language: &KernelLanguage) -> usize {
        let key = KernelTypeSpec::new(mode, language.clone());
        self.state
            .lock()
            .queues
            .get(&key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
