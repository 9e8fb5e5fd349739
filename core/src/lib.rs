//! Core library for kernelhub - multi-tenant compute kernel orchestration
//!
//! # Architecture
//! - `kernel`: the kernel manager (engines, event bus, activity tracking,
//!   warm pool, worker hosting, execute streams)
//! - `error`: the error taxonomy shared by every operation
//!
//! Embedders depend on this crate and register their own language engines;
//! the binary crate adds a thin CLI and the worker-process entry point.

#![deny(unsafe_code)]

pub mod error;
pub mod kernel;

pub use error::{KernelHubError, Result};
pub use kernel::{
    DisplayPayload, EchoEngine, EngineContext, EngineFactory, EngineRegistry, EngineStatus,
    EventBus, EventKind, EventPayload, EventSink, ExecuteErrorPayload, ExecuteStream,
    ExecuteStreamItem, ExecutionInfo, ExecutionOutcome, FilesystemMount, InterruptFlag,
    KernelEngine, KernelEvent, KernelId, KernelInfo, KernelInstance, KernelLanguage,
    KernelManager, KernelMode, KernelOptions, KernelSummary, KernelTypeSpec, ManagerConfig,
    Permissions, PoolConfig, StreamName, WorkerConfig,
};
