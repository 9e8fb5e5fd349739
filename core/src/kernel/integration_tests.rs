//! End-to-end manager scenarios
//!
//! Exercises the full wiring: allow-list enforcement, warm pool takes and
//! refills, inactivity eviction, stall reporting, and stream ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{sleep, timeout, Duration};

use crate::error::KernelHubError;

use super::config::{KernelTypeSpec, ManagerConfig, PoolConfig};
use super::event::{EventKind, EventPayload, KernelEvent};
use super::manager::KernelManager;
use super::stream::ExecuteStreamItem;
use super::types::{KernelId, KernelLanguage, KernelMode, KernelOptions};

fn in_process(language: KernelLanguage) -> KernelTypeSpec {
    KernelTypeSpec::new(KernelMode::InProcess, language)
}

fn base_config() -> ManagerConfig {
    ManagerConfig {
        allowed_kernel_types: vec![
            in_process(KernelLanguage::Python),
            in_process(KernelLanguage::TypeScript),
        ],
        ..Default::default()
    }
}

fn pooled_config(pool_size: usize) -> ManagerConfig {
    let mut config = base_config();
    config.pool = PoolConfig {
        enabled: true,
        pool_size,
        auto_refill: true,
        preload_configs: vec![in_process(KernelLanguage::Python)],
    };
    config
}

fn options(id: &str) -> KernelOptions {
    KernelOptions {
        id: Some(id.to_string()),
        mode: KernelMode::InProcess,
        language: KernelLanguage::Python,
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// S1: creations outside the allow-list are rejected before any allocation
#[tokio::test]
async fn test_allow_list_enforcement() {
    let config = ManagerConfig {
        allowed_kernel_types: vec![KernelTypeSpec::new(
            KernelMode::Worker,
            KernelLanguage::Python,
        )],
        ..Default::default()
    };
    let manager = KernelManager::new(config);

    let err = manager.create(options("denied")).await.unwrap_err();
    assert!(matches!(err, KernelHubError::KernelTypeNotAllowed { .. }));
    assert!(manager.list(None).is_empty());
}

/// S2: a warm pool serves a take instantly and refills behind it
#[tokio::test]
async fn test_pool_warm_take() {
    let manager = KernelManager::new(pooled_config(2));
    let pool = manager.pool().clone();
    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool pre-warm",
    )
    .await;

    let id = manager.create(options("a")).await.unwrap();
    assert_eq!(id.as_str(), "a");

    let listed = manager.list(None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.as_str(), "a");
    assert!(listed[0].from_pool);
    assert!(!listed.iter().any(|summary| summary.id.is_pool_temporary()));

    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool refill after take",
    )
    .await;
}

/// S3: rapid takes past the pool size fall back to on-demand creation
#[tokio::test]
async fn test_pool_empty_fallback() {
    let manager = KernelManager::new(pooled_config(2));
    let pool = manager.pool().clone();
    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool pre-warm",
    )
    .await;

    let (a, b, c) = tokio::join!(
        manager.create(options("a")),
        manager.create(options("b")),
        manager.create(options("c")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(manager.list(None).len(), 3);

    // Two warm entries for three takers: someone built on demand.
    let from_pool = manager
        .list(None)
        .iter()
        .filter(|summary| summary.from_pool)
        .count();
    assert!(from_pool <= 2, "only two kernels were pre-warmed");

    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool refill after burst",
    )
    .await;
}

/// Custom options bypass the pool even when warm entries exist
#[tokio::test]
async fn test_custom_options_bypass_pool() {
    let manager = KernelManager::new(pooled_config(2));
    let pool = manager.pool().clone();
    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool pre-warm",
    )
    .await;

    let mut custom = options("custom");
    custom
        .environment
        .insert("API_KEY".to_string(), "secret".to_string());
    let id = manager.create(custom).await.unwrap();

    let info = manager.get_info(&id).unwrap();
    assert!(!info.summary.from_pool);
    assert_eq!(
        pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python),
        2
    );
}

/// S4: inactivity eviction is deferred while a streamed execution runs
#[tokio::test]
async fn test_inactivity_eviction_deferral() {
    let manager = KernelManager::new(base_config());
    let mut opts = options("lazy");
    opts.inactivity_timeout_ms = 100;
    let id = manager.create(opts).await.unwrap();

    // Ten 50ms slices with an event after each: ~500ms of activity, well
    // past the 100ms idle deadline.
    let code = "sleep:50\nprint:tick\n".repeat(10);
    let mut stream = manager.execute_stream(&id, &code, None);
    let mut events = 0;
    while let Some(item) = stream.next().await {
        match item {
            ExecuteStreamItem::Event(_) => {
                events += 1;
                assert!(
                    manager.ping(&id),
                    "kernel evicted while its execution was still streaming"
                );
            }
            ExecuteStreamItem::Completed(outcome) => assert!(outcome.success),
            ExecuteStreamItem::Failed(err) => panic!("stream failed: {}", err),
        }
    }
    assert_eq!(events, 10);

    // Still alive right after completion; gone once the idle deadline
    // elapses with no further activity.
    assert!(manager.ping(&id));
    sleep(Duration::from_millis(30)).await;
    assert!(manager.ping(&id), "evicted before the idle deadline");
    wait_until(|| manager.list(None).is_empty(), "post-stream eviction").await;
}

/// S5: the stall watchdog reports without killing the execution
#[tokio::test]
async fn test_stalled_execution_event() {
    let manager = KernelManager::new(base_config());
    let mut opts = options("slowpoke");
    opts.max_execution_time_ms = 50;
    let id = manager.create(opts).await.unwrap();

    let stalled: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let stalled_clone = stalled.clone();
    manager.bus().on_kernel(
        id.clone(),
        EventKind::ExecutionStalled,
        Arc::new(move |event: &KernelEvent| {
            if let EventPayload::ExecutionStalled {
                max_execution_time_ms,
                ..
            } = &event.payload
            {
                stalled_clone.lock().push(*max_execution_time_ms);
            }
        }),
    );
    let synthetic = Arc::new(AtomicUsize::new(0));
    let synthetic_clone = synthetic.clone();
    manager.bus().on_kernel(
        id.clone(),
        EventKind::ExecuteError,
        Arc::new(move |event: &KernelEvent| {
            if let EventPayload::ExecuteError(err) = &event.payload {
                if err.ename == "ExecutionStalled" {
                    synthetic_clone.fetch_add(1, Ordering::Relaxed);
                }
            }
        }),
    );

    let outcome = manager.execute(&id, "sleep:500\nresult:done", None).await.unwrap();

    // The watchdog fired mid-execution, and the run still settled normally.
    assert_eq!(*stalled.lock(), vec![50]);
    assert_eq!(synthetic.load(Ordering::Relaxed), 1);
    assert!(outcome.success);
    assert_eq!(outcome.result, Some(Value::String("done".to_string())));
    assert!(manager.ping(&id), "stall must not terminate the kernel");
}

/// S6: streamed events arrive in emission order with payloads intact
#[tokio::test]
async fn test_stream_ordering() {
    let manager = KernelManager::new(base_config());
    let id = manager.create(options("ordered")).await.unwrap();

    let items: Vec<_> = manager
        .execute_stream(&id, "print:a\ndisplay:b\nprint:c\nresult:d", None)
        .collect()
        .await;

    let mut kinds = Vec::new();
    let mut texts = Vec::new();
    for item in &items {
        match item {
            ExecuteStreamItem::Event(event) => {
                kinds.push(event.kind());
                match &event.payload {
                    EventPayload::Stream { text, .. } => texts.push(text.clone()),
                    EventPayload::DisplayData(payload)
                    | EventPayload::ExecuteResult(payload) => {
                        if let Some(Value::String(text)) = payload.data.get("text/plain") {
                            texts.push(text.clone());
                        }
                    }
                    other => panic!("unexpected payload: {:?}", other),
                }
            }
            ExecuteStreamItem::Completed(outcome) => assert!(outcome.success),
            ExecuteStreamItem::Failed(err) => panic!("stream failed: {}", err),
        }
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::Stream,
            EventKind::DisplayData,
            EventKind::Stream,
            EventKind::ExecuteResult,
        ]
    );
    assert_eq!(texts, vec!["a", "b", "c", "d"]);
    assert!(items.last().unwrap().is_terminal());
}

/// Pooled kernels report events under their assigned ID, never the
/// pool-temporary one
#[tokio::test]
async fn test_pooled_kernel_event_identity() {
    let manager = KernelManager::new(pooled_config(1));
    let pool = manager.pool().clone();
    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 1,
        "pool pre-warm",
    )
    .await;

    let seen: Arc<Mutex<Vec<KernelId>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    manager.bus().on_all(
        EventKind::Stream,
        Arc::new(move |event: &KernelEvent| {
            seen_clone.lock().push(event.kernel_id.clone());
        }),
    );

    let id = manager.create(options("tagged")).await.unwrap();
    let info = manager.get_info(&id).unwrap();
    assert!(info.summary.from_pool);

    manager.execute(&id, "print:who-am-i", None).await.unwrap();
    assert_eq!(*seen.lock(), vec![id]);
}

/// Setup failures surface both as a returned error and a synthetic event
#[tokio::test]
async fn test_setup_failure_reports_both_ways() {
    let mut config = base_config();
    config
        .allowed_kernel_types
        .push(in_process(KernelLanguage::Other("lua".to_string())));
    let manager = KernelManager::new(config);

    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    manager.bus().on_all(
        EventKind::ExecuteError,
        Arc::new(move |event: &KernelEvent| {
            if let EventPayload::ExecuteError(err) = &event.payload {
                errors_clone.lock().push(format!("{}:{}", event.kernel_id, err.ename));
            }
        }),
    );

    // No engine is registered for lua, so setup fails after acceptance.
    let mut opts = options("broken");
    opts.language = KernelLanguage::Other("lua".to_string());
    let err = manager.create(opts).await.unwrap_err();
    assert!(matches!(err, KernelHubError::KernelSetupError { .. }));
    assert!(manager.list(None).is_empty());
    assert_eq!(*errors.lock(), vec!["broken:KernelSetupError".to_string()]);

    // The failed ID is reusable once the engine exists.
    manager.create(options("broken")).await.unwrap();
}

/// Destroying a kernel mid-stream fails the stream and still completes
#[tokio::test]
async fn test_destroy_during_stream() {
    let manager = KernelManager::new(base_config());
    let id = manager.create(options("doomed")).await.unwrap();

    let mut stream = manager.execute_stream(&id, "sleep:5000\nprint:never", None);
    sleep(Duration::from_millis(50)).await;
    manager.destroy(&id).await.unwrap();

    let item = timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream must settle after destroy")
        .unwrap();
    assert!(matches!(
        item,
        ExecuteStreamItem::Failed(KernelHubError::StreamInterrupted { .. })
    ));
    assert!(stream.next().await.is_none());
    assert!(manager.list(None).is_empty());
}

/// Round trip leaves no listener, timer, or tracked state behind
#[tokio::test]
async fn test_create_destroy_leaves_no_residue() {
    let manager = KernelManager::new(base_config());
    let id = manager.create(options("clean")).await.unwrap();

    // Attach a subscriber and run something so every subsystem engages.
    manager.bus().on_kernel(
        id.clone(),
        EventKind::Stream,
        Arc::new(|_event: &KernelEvent| {}),
    );
    manager.execute(&id, "print:x", None).await.unwrap();
    assert!(manager.tracker().is_tracked(&id));
    assert_eq!(manager.bus().kernel_listener_count(&id), 1);

    manager.destroy(&id).await.unwrap();
    assert!(!manager.tracker().is_tracked(&id));
    assert_eq!(manager.bus().kernel_listener_count(&id), 0);
    assert!(matches!(
        manager.get_info(&id),
        Err(KernelHubError::KernelNotFound { .. })
    ));
}

/// Interrupting a streamed execution surfaces the error and completes
#[tokio::test]
async fn test_interrupt_cancels_running_execution() {
    let manager = KernelManager::new(base_config());
    let id = manager.create(options("interruptible")).await.unwrap();

    let mut stream = manager.execute_stream(&id, "print:started\nsleep:5000", None);
    let first = stream.next().await.unwrap();
    assert!(matches!(first, ExecuteStreamItem::Event(_)));

    assert!(manager.interrupt(&id).await.unwrap());

    let mut saw_error_event = false;
    let mut completed = false;
    while let Some(item) = stream.next().await {
        match item {
            ExecuteStreamItem::Event(event) => {
                if event.kind() == EventKind::ExecuteError {
                    saw_error_event = true;
                }
            }
            ExecuteStreamItem::Completed(outcome) => {
                assert!(!outcome.success);
                assert_eq!(outcome.error.unwrap().ename, "ExecutionInterrupted");
                completed = true;
            }
            ExecuteStreamItem::Failed(err) => panic!("stream failed: {}", err),
        }
    }
    assert!(saw_error_event);
    assert!(completed);
}

/// The manager delivers the filesystem mount to the engine untouched; the
/// rewrite itself is the engine's job
#[tokio::test]
async fn test_filesystem_mount_delivered_to_engine() {
    use crate::kernel::engine::{EngineContext, EngineStatus, KernelEngine};
    use crate::kernel::types::FilesystemMount;
    use async_trait::async_trait;

    struct RecordingEngine {
        seen: Arc<Mutex<Option<EngineContext>>>,
    }

    #[async_trait]
    impl KernelEngine for RecordingEngine {
        async fn initialize(&self, ctx: EngineContext) -> crate::error::Result<()> {
            *self.seen.lock() = Some(ctx);
            Ok(())
        }
        async fn execute(
            &self,
            _code: &str,
            _parent: Option<Value>,
        ) -> crate::error::Result<crate::kernel::engine::ExecutionOutcome> {
            Ok(crate::kernel::engine::ExecutionOutcome::ok(None))
        }
        async fn interrupt(&self) -> bool {
            false
        }
        fn status(&self) -> EngineStatus {
            EngineStatus::Active
        }
    }

    let root = tempfile::tempdir().unwrap();
    let seen: Arc<Mutex<Option<EngineContext>>> = Arc::new(Mutex::new(None));

    let registry = Arc::new(crate::kernel::engine::EngineRegistry::new());
    let seen_clone = seen.clone();
    registry.register(
        KernelLanguage::Python,
        Arc::new(move || {
            Arc::new(RecordingEngine {
                seen: seen_clone.clone(),
            }) as Arc<dyn KernelEngine>
        }),
    );
    let manager = KernelManager::with_registry(base_config(), registry);

    let mut opts = options("mounted");
    opts.filesystem = Some(FilesystemMount {
        mount_point: "/data".to_string(),
        root: root.path().to_path_buf(),
    });
    opts.environment
        .insert("WORKSPACE".to_string(), "demo".to_string());
    manager.create(opts).await.unwrap();

    let ctx = seen.lock().clone().expect("engine was initialized");
    let mount = ctx.filesystem.expect("mount delivered");
    assert_eq!(mount.mount_point, "/data");
    assert_eq!(mount.root, root.path());
    assert_eq!(ctx.environment.get("WORKSPACE").map(String::as_str), Some("demo"));
}

/// Shutdown drains the pool and empties the table
#[tokio::test]
async fn test_shutdown_drains_everything() {
    let manager = KernelManager::new(pooled_config(2));
    let pool = manager.pool().clone();
    wait_until(
        || pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python) == 2,
        "pool pre-warm",
    )
    .await;
    manager.create(options("a")).await.unwrap();

    manager.shutdown().await.unwrap();
    assert!(manager.list(None).is_empty());
    assert_eq!(
        pool.pending_count(KernelMode::InProcess, &KernelLanguage::Python),
        0
    );
}
