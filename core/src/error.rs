//! Structured error types for kernelhub
//!
//! Every fallible manager operation returns one of these variants in a
//! `Result`; asynchronous failures with no direct caller (watchdogs, pool
//! rejections) are surfaced as synthetic `execute_error` events instead.

use thiserror::Error;

/// Primary error type for kernel manager operations
#[derive(Error, Debug)]
pub enum KernelHubError {
    // =========================================================================
    // Creation Errors
    // =========================================================================
    /// Requested (mode, language) pair is outside the allow-list
    #[error("kernel type not allowed: {mode}/{language}")]
    KernelTypeNotAllowed { mode: String, language: String },

    /// A kernel with the computed ID already exists
    #[error("kernel already exists: {id}")]
    DuplicateKernel { id: String },

    /// Caller-supplied base ID contains the reserved namespace separator
    #[error("invalid kernel id {id:?}: {reason}")]
    InvalidKernelId { id: String, reason: String },

    /// Creation was accepted but the kernel could not be set up
    #[error("kernel setup failed for {id}: {reason}")]
    KernelSetupError { id: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation on an unknown kernel ID
    #[error("kernel not found: {id}")]
    KernelNotFound { id: String },

    /// Restart produced a different ID than the original
    #[error("restart of {id} produced mismatched id {recreated}")]
    RestartIdMismatch { id: String, recreated: String },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Worker process could not be spawned or failed its handshake
    #[error("worker spawn failed: {reason}")]
    WorkerSpawnError { reason: String },

    /// Worker process died after reaching the ready state
    #[error("worker crashed: {reason}")]
    WorkerCrashed { reason: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Underlying engine rejected initialization
    #[error("engine initialization failed: {reason}")]
    EngineInitError { reason: String },

    /// No engine factory is registered for the requested language
    #[error("no engine registered for language: {language}")]
    EngineNotRegistered { language: String },

    /// Engine reported an execution failure outside the normal error event path
    #[error("execution failed: {reason}")]
    ExecutionFailed { reason: String },

    // =========================================================================
    // Streaming Errors
    // =========================================================================
    /// `execute_stream` exceeded its bounded wait
    #[error("execute stream timed out after {timeout_ms}ms")]
    StreamTimeout { timeout_ms: u64 },

    /// The kernel was destroyed while a stream was being consumed
    #[error("kernel {id} was destroyed during streaming")]
    StreamInterrupted { id: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl KernelHubError {
    /// Whether the error indicates the kernel is gone and its entry should be
    /// reaped rather than retried
    pub fn is_fatal_for_kernel(&self) -> bool {
        matches!(
            self,
            Self::WorkerCrashed { .. } | Self::KernelNotFound { .. }
        )
    }

    /// Short machine-readable name used as the `ename` of synthetic
    /// `execute_error` events
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::KernelTypeNotAllowed { .. } => "KernelTypeNotAllowed",
            Self::DuplicateKernel { .. } => "DuplicateKernel",
            Self::InvalidKernelId { .. } => "InvalidKernelId",
            Self::KernelSetupError { .. } => "KernelSetupError",
            Self::KernelNotFound { .. } => "KernelNotFound",
            Self::RestartIdMismatch { .. } => "RestartIdMismatch",
            Self::WorkerSpawnError { .. } => "WorkerSpawnError",
            Self::WorkerCrashed { .. } => "WorkerCrashed",
            Self::EngineInitError { .. } => "EngineInitError",
            Self::EngineNotRegistered { .. } => "EngineNotRegistered",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::StreamTimeout { .. } => "StreamTimeout",
            Self::StreamInterrupted { .. } => "StreamInterrupted",
            Self::Io(_) => "IoError",
            Self::Protocol(_) => "ProtocolError",
        }
    }
}

impl From<serde_json::Error> for KernelHubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type alias using KernelHubError
pub type Result<T> = std::result::Result<T, KernelHubError>;
