//! Worker-side runtime
//!
//! The loop a worker process runs: read host messages from stdin, host one
//! engine, and write events and replies to stdout. The binary re-enters this
//! through its `worker` subcommand; tests drive it over an in-memory duplex.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::kernel::engine::{
    EngineContext, EngineRegistry, EventSink, ExecutionOutcome, InterruptFlag, KernelEngine,
};
use crate::kernel::event::ExecuteErrorPayload;

use super::protocol::{write_line, HostMessage, WorkerMessage};

/// Run the worker loop over the process stdio
pub async fn run_stdio(registry: Arc<EngineRegistry>) -> Result<()> {
    run(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the worker loop over an arbitrary transport until the host closes the
/// channel or sends `shutdown`
pub async fn run<R, W>(registry: Arc<EngineRegistry>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            if write_line(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    let mut engine: Option<Arc<dyn KernelEngine>> = None;
    let interrupt = InterruptFlag::new();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let message: HostMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "undecodable host message");
                continue;
            }
        };

        match message {
            HostMessage::InitializeKernel { options } => {
                if engine.is_some() {
                    // Idempotent: already initialized.
                    let _ = tx.send(WorkerMessage::KernelInitialized {
                        success: true,
                        error: None,
                    });
                    continue;
                }
                let reply = match registry.create_engine(&options.language) {
                    Ok(new_engine) => {
                        let event_tx = tx.clone();
                        let sink = EventSink::new(move |payload| {
                            let _ = event_tx.send(WorkerMessage::Event { event: payload });
                        });
                        let mut ctx = EngineContext::new(sink, interrupt.clone());
                        ctx.environment = options.environment;
                        ctx.filesystem = options.filesystem;
                        match new_engine.initialize(ctx).await {
                            Ok(()) => {
                                engine = Some(new_engine);
                                WorkerMessage::KernelInitialized {
                                    success: true,
                                    error: None,
                                }
                            }
                            Err(err) => WorkerMessage::KernelInitialized {
                                success: false,
                                error: Some(err.to_string()),
                            },
                        }
                    }
                    Err(err) => WorkerMessage::KernelInitialized {
                        success: false,
                        error: Some(err.to_string()),
                    },
                };
                let _ = tx.send(reply);
            }
            HostMessage::ExecuteRequest {
                execution_id,
                code,
                parent,
            } => {
                let Some(engine) = engine.clone() else {
                    let _ = tx.send(WorkerMessage::ExecuteComplete {
                        execution_id,
                        outcome: ExecutionOutcome::failed(ExecuteErrorPayload::new(
                            "EngineInitError",
                            "execute before initialization",
                        )),
                    });
                    continue;
                };
                // Run on a separate task so interrupts stay responsive.
                let reply_tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = match engine.execute(&code, parent).await {
                        Ok(outcome) => outcome,
                        Err(err) => ExecutionOutcome::failed(ExecuteErrorPayload::new(
                            err.kind_name(),
                            err.to_string(),
                        )),
                    };
                    let _ = reply_tx.send(WorkerMessage::ExecuteComplete {
                        execution_id,
                        outcome,
                    });
                });
            }
            HostMessage::InterruptKernel => {
                let success = match engine.as_ref() {
                    Some(engine) => {
                        interrupt.trigger();
                        engine.interrupt().await
                    }
                    None => false,
                };
                let _ = tx.send(WorkerMessage::InterruptTriggered { success });
            }
            HostMessage::InputReply { value } => {
                if let Some(engine) = engine.as_ref() {
                    let _ = engine.input_reply(value).await;
                }
            }
            HostMessage::Shutdown => break,
        }
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}
