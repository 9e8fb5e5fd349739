//! Core kernel data model
//!
//! Modes, languages, IDs, creation options, and the public summary types
//! returned by the manager.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace separator inside a kernel ID. Reserved: user-supplied base IDs
/// must not contain it.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Prefix used for the temporary IDs of pool-created kernels. These never
/// appear in `list()` output; the kernel is retagged at take time.
pub const POOL_ID_PREFIX: &str = "pool-";

/// Scheduling mode of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelMode {
    /// Engine runs inside the manager's process
    InProcess,
    /// Engine runs in an isolated worker process
    Worker,
}

impl std::fmt::Display for KernelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelMode::InProcess => write!(f, "in_process"),
            KernelMode::Worker => write!(f, "worker"),
        }
    }
}

/// Language a kernel executes. Open set: additional languages must pair with
/// a registered engine factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelLanguage {
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "typescript")]
    TypeScript,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for KernelLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelLanguage::Python => write!(f, "python"),
            KernelLanguage::TypeScript => write!(f, "typescript"),
            KernelLanguage::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Opaque kernel identifier: `"<namespace>:<base>"` when a namespace is
/// given, else `"<base>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    /// Compose an ID from an optional namespace and a base
    pub fn new(namespace: Option<&str>, base: &str) -> Self {
        match namespace {
            Some(ns) => Self(format!("{}{}{}", ns, NAMESPACE_SEPARATOR, base)),
            None => Self(base.to_string()),
        }
    }

    /// A fresh temporary ID for a pool-created kernel
    pub fn pool_temporary() -> Self {
        Self(format!("{}{}", POOL_ID_PREFIX, Uuid::new_v4()))
    }

    /// A fresh UUID base with no namespace
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace prefix, if any
    pub fn namespace(&self) -> Option<&str> {
        self.0
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(ns, _)| ns)
    }

    /// The base part (everything after the namespace separator)
    pub fn base(&self) -> &str {
        self.0
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(_, base)| base)
            .unwrap_or(&self.0)
    }

    /// Whether this is a temporary pool ID
    pub fn is_pool_temporary(&self) -> bool {
        self.0.starts_with(POOL_ID_PREFIX)
    }

    /// Whether this ID belongs to the given namespace filter. A `None` filter
    /// matches every kernel.
    pub fn in_namespace(&self, namespace: Option<&str>) -> bool {
        match namespace {
            Some(ns) => self.namespace() == Some(ns),
            None => true,
        }
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource permissions granted to a worker-mode kernel. `None` fields leave
/// the corresponding capability disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    /// Hosts the worker may reach, or an empty list for all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_net: Option<Vec<String>>,
    /// Paths the worker may read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_read: Option<Vec<PathBuf>>,
    /// Paths the worker may write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<Vec<PathBuf>>,
    /// Environment variables the worker may read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_env: Option<Vec<String>>,
}

/// A virtual-to-host path rewrite delivered to the engine. Rewrites are
/// string-prefix based; paths outside the mount pass through unchanged. The
/// manager only transports the pair; the engine applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemMount {
    /// Virtual prefix as seen by executed code
    pub mount_point: String,
    /// Host directory backing the mount point
    pub root: PathBuf,
}

/// Creation options for a kernel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Caller-supplied base ID. Must not contain `:`. A fresh UUID is used
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: KernelMode,
    #[serde(default = "default_language")]
    pub language: KernelLanguage,
    /// Per-tenant ID prefix for listing and destroy-all isolation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Worker-only resource permissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemMount>,
    /// Variables exposed to the engine globally
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Idle time in milliseconds after which the kernel is destroyed.
    /// 0 disables.
    #[serde(default)]
    pub inactivity_timeout_ms: u64,
    /// Per-execution deadline in milliseconds beyond which a stalled event is
    /// emitted. 0 disables.
    #[serde(default)]
    pub max_execution_time_ms: u64,
}

fn default_mode() -> KernelMode {
    KernelMode::Worker
}

fn default_language() -> KernelLanguage {
    KernelLanguage::Python
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            id: None,
            mode: default_mode(),
            language: default_language(),
            namespace: None,
            permissions: None,
            filesystem: None,
            environment: HashMap::new(),
            inactivity_timeout_ms: 0,
            max_execution_time_ms: 0,
        }
    }
}

impl KernelOptions {
    /// Whether a creation with these options may be satisfied from the warm
    /// pool. Custom filesystem mounts, permissions, environment, or explicit
    /// timeouts require a dedicated creation.
    pub fn is_pool_eligible(&self) -> bool {
        self.permissions.is_none()
            && self.filesystem.is_none()
            && self.environment.is_empty()
            && self.inactivity_timeout_ms == 0
            && self.max_execution_time_ms == 0
    }
}

/// Public per-kernel summary returned by `list()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSummary {
    pub id: KernelId,
    pub mode: KernelMode,
    pub language: KernelLanguage,
    pub created: DateTime<Utc>,
    pub namespace: Option<String>,
    pub from_pool: bool,
}

/// Point-in-time execution statistics for one kernel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Number of ongoing executions
    pub count: usize,
    /// Whether the longest-running execution exceeds the configured deadline
    pub is_stuck: bool,
    /// Age of the oldest ongoing execution in milliseconds
    pub longest_running_ms: u64,
}

/// Extended summary including live activity data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfo {
    #[serde(flatten)]
    pub summary: KernelSummary,
    pub execution: ExecutionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_id_namespacing() {
        let id = KernelId::new(Some("tenant-a"), "main");
        assert_eq!(id.as_str(), "tenant-a:main");
        assert_eq!(id.namespace(), Some("tenant-a"));
        assert_eq!(id.base(), "main");
        assert!(id.in_namespace(Some("tenant-a")));
        assert!(!id.in_namespace(Some("tenant-b")));
        assert!(id.in_namespace(None));

        let bare = KernelId::new(None, "main");
        assert_eq!(bare.as_str(), "main");
        assert_eq!(bare.namespace(), None);
        assert_eq!(bare.base(), "main");
    }

    #[test]
    fn test_pool_temporary_ids() {
        let id = KernelId::pool_temporary();
        assert!(id.is_pool_temporary());
        assert!(!KernelId::new(Some("ns"), "base").is_pool_temporary());
    }

    #[test]
    fn test_pool_eligibility() {
        assert!(KernelOptions::default().is_pool_eligible());

        let opts = KernelOptions {
            inactivity_timeout_ms: 1000,
            ..Default::default()
        };
        assert!(!opts.is_pool_eligible());

        let opts = KernelOptions {
            filesystem: Some(FilesystemMount {
                mount_point: "/data".to_string(),
                root: PathBuf::from("/tmp/data"),
            }),
            ..Default::default()
        };
        assert!(!opts.is_pool_eligible());
    }

    #[test]
    fn test_language_serde() {
        let json = serde_json::to_string(&KernelLanguage::Python).unwrap();
        assert_eq!(json, "\"python\"");
        let other: KernelLanguage = serde_json::from_str("\"lua\"").unwrap();
        assert_eq!(other, KernelLanguage::Other("lua".to_string()));
    }
}
