//! Manager configuration
//!
//! Allow-list, pool sizing, and worker process settings. Embedders provide
//! values through their own configuration layer; no file format is mandated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::{KernelLanguage, KernelMode};

/// A (mode, language) pair, used for the allow-list and pool keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelTypeSpec {
    pub mode: KernelMode,
    pub language: KernelLanguage,
}

impl KernelTypeSpec {
    pub fn new(mode: KernelMode, language: KernelLanguage) -> Self {
        Self { mode, language }
    }
}

impl std::fmt::Display for KernelTypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.mode, self.language)
    }
}

/// Warm pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Master switch; a disabled pool never holds kernels
    #[serde(default)]
    pub enabled: bool,
    /// Target queue length per (mode, language) key
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Schedule a refill after every take
    #[serde(default = "default_true")]
    pub auto_refill: bool,
    /// Keys that are pre-warmed; must be a subset of the allow-list
    #[serde(default)]
    pub preload_configs: Vec<KernelTypeSpec>,
}

fn default_pool_size() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: default_pool_size(),
            auto_refill: true,
            preload_configs: Vec::new(),
        }
    }
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program to launch for worker-mode kernels. Defaults to the current
    /// executable, re-entered through its `worker` subcommand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    /// Arguments passed to the worker program
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// How long to wait for the `kernel_initialized` handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// How long to wait for an `interrupt_triggered` acknowledgment
    #[serde(default = "default_interrupt_ack_timeout_ms")]
    pub interrupt_ack_timeout_ms: u64,
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_interrupt_ack_timeout_ms() -> u64 {
    2_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            interrupt_ack_timeout_ms: default_interrupt_ack_timeout_ms(),
        }
    }
}

/// Top-level manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// (mode, language) pairs the manager may instantiate
    #[serde(default = "default_allowed_kernel_types")]
    pub allowed_kernel_types: Vec<KernelTypeSpec>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Bounded wait for `execute_stream` consumers
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    /// Soft cap on events buffered per stream before dropping with a warning
    #[serde(default = "default_stream_buffer_cap")]
    pub stream_buffer_cap: usize,
}

fn default_allowed_kernel_types() -> Vec<KernelTypeSpec> {
    vec![
        KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Python),
        KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::TypeScript),
    ]
}

fn default_stream_timeout_ms() -> u64 {
    60_000
}

fn default_stream_buffer_cap() -> usize {
    10_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            allowed_kernel_types: default_allowed_kernel_types(),
            pool: PoolConfig::default(),
            worker: WorkerConfig::default(),
            stream_timeout_ms: default_stream_timeout_ms(),
            stream_buffer_cap: default_stream_buffer_cap(),
        }
    }
}

impl ManagerConfig {
    /// Whether the allow-list permits this (mode, language) pair
    pub fn is_allowed(&self, mode: KernelMode, language: &KernelLanguage) -> bool {
        self.allowed_kernel_types
            .iter()
            .any(|spec| spec.mode == mode && &spec.language == language)
    }

    /// Whether the pool pre-warms this pair
    pub fn is_preloaded(&self, mode: KernelMode, language: &KernelLanguage) -> bool {
        self.pool.enabled
            && self
                .pool
                .preload_configs
                .iter()
                .any(|spec| spec.mode == mode && &spec.language == language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list_is_worker_only() {
        let config = ManagerConfig::default();
        assert!(config.is_allowed(KernelMode::Worker, &KernelLanguage::Python));
        assert!(config.is_allowed(KernelMode::Worker, &KernelLanguage::TypeScript));
        assert!(!config.is_allowed(KernelMode::InProcess, &KernelLanguage::Python));
    }

    #[test]
    fn test_preload_requires_enabled_pool() {
        let mut config = ManagerConfig::default();
        config.pool.preload_configs = vec![KernelTypeSpec::new(
            KernelMode::Worker,
            KernelLanguage::Python,
        )];
        assert!(!config.is_preloaded(KernelMode::Worker, &KernelLanguage::Python));

        config.pool.enabled = true;
        assert!(config.is_preloaded(KernelMode::Worker, &KernelLanguage::Python));
        assert!(!config.is_preloaded(KernelMode::Worker, &KernelLanguage::TypeScript));
    }
}
