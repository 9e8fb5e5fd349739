//! Kernel orchestration
//!
//! The manager allocates code-execution engines (in-process or in isolated
//! worker processes), keeps a warm pool of pre-initialized kernels, tracks
//! per-kernel activity and stuck executions, and fans engine events out to
//! subscribers with correct identity tagging.

pub mod activity;
pub mod config;
pub mod engine;
pub mod event;
pub mod manager;
pub mod pool;
pub mod stream;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use activity::ActivityTracker;
pub use config::{KernelTypeSpec, ManagerConfig, PoolConfig, WorkerConfig};
pub use engine::{
    EchoEngine, EngineContext, EngineFactory, EngineRegistry, EngineStatus, EventSink,
    ExecutionOutcome, InterruptFlag, KernelEngine,
};
pub use event::{
    DisplayPayload, EventBus, EventKind, EventListener, EventPayload, ExecuteErrorPayload,
    KernelEvent, StreamName, SubscriptionId,
};
pub use manager::{KernelInstance, KernelManager};
pub use pool::{KernelPool, PreparedKernel};
pub use stream::{ExecuteStream, ExecuteStreamItem};
pub use types::{
    ExecutionInfo, FilesystemMount, KernelId, KernelInfo, KernelLanguage, KernelMode,
    KernelOptions, KernelSummary, Permissions,
};
