//! Isolated-process kernel hosting
//!
//! `host` supervises worker processes from the manager side; `runtime` is the
//! loop a worker runs; `protocol` defines the messages between them.

pub mod host;
pub mod protocol;
pub mod runtime;

pub use host::{WorkerEngine, WorkerHandle, WorkerState};
pub use protocol::{HostMessage, WorkerInitOptions, WorkerMessage};
