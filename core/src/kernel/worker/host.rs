//! Worker host
//!
//! Launches and supervises an isolated-process kernel, couples its stdio
//! message channel to the event bus, and presents it to the manager behind
//! the same engine contract as in-process kernels.
//!
//! The transport is generic over reader/writer pairs, so tests drive a host
//! against an in-memory duplex instead of a spawned process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{KernelHubError, Result};
use crate::kernel::config::WorkerConfig;
use crate::kernel::engine::{EngineContext, EngineStatus, ExecutionOutcome, KernelEngine};
use crate::kernel::event::{EventBus, KernelEvent};
use crate::kernel::types::KernelId;

use super::protocol::{write_line, HostMessage, WorkerInitOptions, WorkerMessage};

/// Supervisor-observed worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Process launched, handshake not yet received
    Spawning,
    /// Handshake received, no execution yet
    Initialized,
    /// At least one execute request in flight
    Running,
    /// Between executions
    Idle,
    Terminating,
    Terminated,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct WorkerShared {
    id_cell: Arc<RwLock<KernelId>>,
    bus: Arc<EventBus>,
    state: Mutex<WorkerState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    handshake: Mutex<Option<oneshot::Sender<(bool, Option<String>)>>>,
    interrupt_ack: Mutex<Option<oneshot::Sender<bool>>>,
    executions: Mutex<HashMap<String, oneshot::Sender<ExecutionOutcome>>>,
    interrupt_ack_timeout: Duration,
}

impl WorkerShared {
    fn handle_message(&self, message: WorkerMessage) {
        let state = *self.state.lock();
        if state == WorkerState::Spawning
            && !matches!(message, WorkerMessage::KernelInitialized { .. })
        {
            warn!(kernel = %self.id_cell.read(), "dropping pre-handshake worker message");
            return;
        }

        match message {
            WorkerMessage::KernelInitialized { success, error } => {
                if state == WorkerState::Spawning {
                    *self.state.lock() = WorkerState::Initialized;
                }
                if let Some(sender) = self.handshake.lock().take() {
                    let _ = sender.send((success, error));
                }
            }
            WorkerMessage::Event { event } => {
                let kernel_id = self.id_cell.read().clone();
                self.bus.emit(&KernelEvent::new(kernel_id, event));
            }
            WorkerMessage::ExecuteComplete {
                execution_id,
                outcome,
            } => {
                let sender = {
                    let mut executions = self.executions.lock();
                    let sender = executions.remove(&execution_id);
                    if executions.is_empty() {
                        let mut state = self.state.lock();
                        if *state == WorkerState::Running {
                            *state = WorkerState::Idle;
                        }
                    }
                    sender
                };
                match sender {
                    Some(sender) => {
                        let _ = sender.send(outcome);
                    }
                    None => warn!(execution = %execution_id, "completion for unknown execution"),
                }
            }
            WorkerMessage::InterruptTriggered { success } => {
                if let Some(sender) = self.interrupt_ack.lock().take() {
                    let _ = sender.send(success);
                }
            }
        }
    }

    /// Channel closed: the worker exited or was killed. Pending waiters are
    /// failed by dropping their senders.
    fn on_disconnect(&self) {
        let was_expected = {
            let mut state = self.state.lock();
            let expected = matches!(*state, WorkerState::Terminating | WorkerState::Terminated);
            *state = WorkerState::Terminated;
            expected
        };
        if !was_expected {
            warn!(kernel = %self.id_cell.read(), "worker channel closed unexpectedly");
        }
        self.handshake.lock().take();
        self.interrupt_ack.lock().take();
        self.executions.lock().clear();
    }

    async fn send(&self, message: &HostMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => write_line(writer, message).await,
            None => Err(KernelHubError::WorkerCrashed {
                reason: "worker channel is closed".to_string(),
            }),
        }
    }
}

/// Handle to a supervised worker process (or an in-memory transport in tests)
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    child: tokio::sync::Mutex<Option<Child>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn a worker process per `config`, perform the initialization
    /// handshake, and return the coupled handle
    pub async fn spawn(
        config: &WorkerConfig,
        init: WorkerInitOptions,
        bus: Arc<EventBus>,
        id_cell: Arc<RwLock<KernelId>>,
    ) -> Result<Arc<Self>> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|err| KernelHubError::WorkerSpawnError {
                reason: format!("cannot resolve worker executable: {}", err),
            })?,
        };

        let mut child = Command::new(&program)
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| KernelHubError::WorkerSpawnError {
                reason: format!("failed to launch {:?}: {}", program, err),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| KernelHubError::WorkerSpawnError {
            reason: "worker stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| KernelHubError::WorkerSpawnError {
            reason: "worker stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take();

        let handle = Self::connect(stdout, stdin, bus, id_cell, config.interrupt_ack_timeout_ms);
        *handle.child.lock().await = Some(child);

        if let Some(stderr) = stderr {
            let id_cell = handle.shared.id_cell.clone();
            let task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(kernel = %id_cell.read(), "worker stderr: {}", line);
                }
            });
            *handle.stderr_task.lock() = Some(task);
        }

        match handle
            .initialize(init, Duration::from_millis(config.handshake_timeout_ms))
            .await
        {
            Ok(()) => Ok(handle),
            Err(err) => {
                handle.terminate().await;
                Err(err)
            }
        }
    }

    /// Couple a handle to an existing transport. The reader task starts
    /// immediately; the caller still owns the handshake via `initialize`.
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        bus: Arc<EventBus>,
        id_cell: Arc<RwLock<KernelId>>,
        interrupt_ack_timeout_ms: u64,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(WorkerShared {
            id_cell,
            bus,
            state: Mutex::new(WorkerState::Spawning),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer) as BoxedWriter)),
            handshake: Mutex::new(None),
            interrupt_ack: Mutex::new(None),
            executions: Mutex::new(HashMap::new()),
            interrupt_ack_timeout: Duration::from_millis(interrupt_ack_timeout_ms),
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => reader_shared.handle_message(message),
                    Err(err) => warn!(error = %err, "undecodable worker message"),
                }
            }
            reader_shared.on_disconnect();
        });

        Arc::new(Self {
            shared,
            child: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(Some(reader_task)),
            stderr_task: Mutex::new(None),
        })
    }

    /// Send `initialize_kernel` and await the handshake within `deadline`
    pub async fn initialize(&self, options: WorkerInitOptions, deadline: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.shared.handshake.lock() = Some(tx);
        self.shared
            .send(&HostMessage::InitializeKernel { options })
            .await?;

        match timeout(deadline, rx).await {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, error))) => Err(KernelHubError::WorkerSpawnError {
                reason: error.unwrap_or_else(|| "worker reported initialization failure".to_string()),
            }),
            Ok(Err(_)) => Err(KernelHubError::WorkerSpawnError {
                reason: "worker exited before handshake".to_string(),
            }),
            Err(_) => Err(KernelHubError::WorkerSpawnError {
                reason: format!("handshake timed out after {:?}", deadline),
            }),
        }
    }

    /// Retag the event channel: all subsequent worker events carry `new_id`
    pub fn rebind_event_channel(&self, new_id: KernelId) {
        *self.shared.id_cell.write() = new_id;
    }

    /// Run code in the worker and await its settled outcome
    pub async fn execute(&self, code: &str, parent: Option<Value>) -> Result<ExecutionOutcome> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                WorkerState::Terminating | WorkerState::Terminated => {
                    return Err(KernelHubError::WorkerCrashed {
                        reason: "worker is terminated".to_string(),
                    })
                }
                WorkerState::Spawning => {
                    return Err(KernelHubError::WorkerSpawnError {
                        reason: "worker not initialized".to_string(),
                    })
                }
                _ => *state = WorkerState::Running,
            }
        }

        let execution_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared
            .executions
            .lock()
            .insert(execution_id.clone(), tx);

        let request = HostMessage::ExecuteRequest {
            execution_id: execution_id.clone(),
            code: code.to_string(),
            parent,
        };
        if let Err(err) = self.shared.send(&request).await {
            let mut executions = self.shared.executions.lock();
            executions.remove(&execution_id);
            if executions.is_empty() {
                let mut state = self.shared.state.lock();
                if *state == WorkerState::Running {
                    *state = WorkerState::Idle;
                }
            }
            return Err(err);
        }

        rx.await.map_err(|_| KernelHubError::WorkerCrashed {
            reason: "worker exited during execution".to_string(),
        })
    }

    /// Message-based interrupt with a bounded acknowledgment wait. The stdio
    /// transport cannot share memory across the process boundary, so this is
    /// the only interrupt path for workers; cancellation latency is one
    /// channel round trip.
    pub async fn send_interrupt(&self) -> bool {
        if matches!(
            *self.shared.state.lock(),
            WorkerState::Terminating | WorkerState::Terminated | WorkerState::Spawning
        ) {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        *self.shared.interrupt_ack.lock() = Some(tx);
        if self.shared.send(&HostMessage::InterruptKernel).await.is_err() {
            self.shared.interrupt_ack.lock().take();
            return false;
        }
        matches!(
            timeout(self.shared.interrupt_ack_timeout, rx).await,
            Ok(Ok(true))
        )
    }

    /// Forward a reply to a pending `input_request`
    pub async fn input_reply(&self, value: String) -> Result<()> {
        self.shared.send(&HostMessage::InputReply { value }).await
    }

    /// Unconditional kill. Idempotent; safe to call on a crashed worker.
    pub async fn terminate(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, WorkerState::Terminating | WorkerState::Terminated) {
                return;
            }
            *state = WorkerState::Terminating;
        }
        // Best-effort graceful request before the kill.
        let _ = self.shared.send(&HostMessage::Shutdown).await;
        *self.shared.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }

        *self.shared.state.lock() = WorkerState::Terminated;
        self.shared.on_disconnect();
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Engine-status view of the worker lifecycle
    pub fn status(&self) -> EngineStatus {
        match self.state() {
            WorkerState::Spawning => EngineStatus::Unknown,
            WorkerState::Initialized | WorkerState::Idle => EngineStatus::Active,
            WorkerState::Running => EngineStatus::Busy,
            WorkerState::Terminating | WorkerState::Terminated => EngineStatus::Terminated,
        }
    }
}

/// Engine facade over a worker handle, so the manager routes execute and
/// interrupt uniformly across both scheduling modes
pub struct WorkerEngine {
    handle: Arc<WorkerHandle>,
}

impl WorkerEngine {
    pub fn new(handle: Arc<WorkerHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl KernelEngine for WorkerEngine {
    async fn initialize(&self, _ctx: EngineContext) -> Result<()> {
        // The worker engine initializes during the spawn handshake; the
        // context travels over the wire instead.
        Ok(())
    }

    async fn execute(&self, code: &str, parent: Option<Value>) -> Result<ExecutionOutcome> {
        self.handle.execute(code, parent).await
    }

    async fn interrupt(&self) -> bool {
        self.handle.send_interrupt().await
    }

    fn status(&self) -> EngineStatus {
        self.handle.status()
    }

    async fn input_reply(&self, value: String) -> Result<()> {
        self.handle.input_reply(value).await
    }
}
