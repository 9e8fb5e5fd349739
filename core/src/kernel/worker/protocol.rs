//! Host/worker wire protocol
//!
//! Newline-delimited JSON messages over the worker's stdio. Each message is a
//! tagged object; engine events pass through embedded in `event` messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::kernel::engine::ExecutionOutcome;
use crate::kernel::event::EventPayload;
use crate::kernel::types::{FilesystemMount, KernelLanguage, Permissions};

/// Initialization payload carried by `initialize_kernel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInitOptions {
    pub language: KernelLanguage,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

impl WorkerInitOptions {
    pub fn for_language(language: KernelLanguage) -> Self {
        Self {
            language,
            environment: HashMap::new(),
            filesystem: None,
            permissions: None,
        }
    }
}

/// Messages sent from the manager to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Begin engine initialization; answered by `kernel_initialized`
    InitializeKernel { options: WorkerInitOptions },
    /// Run code; answered by `execute_complete` after all events
    ExecuteRequest {
        execution_id: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<Value>,
    },
    /// Request cancellation; answered by `interrupt_triggered`
    InterruptKernel,
    /// Reply to a pending `input_request` event
    InputReply { value: String },
    /// Graceful shutdown request; the host kills the process regardless
    Shutdown,
}

/// Messages sent from a worker process to the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Handshake: initialization finished
    KernelInitialized {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Settled value of one execute request
    ExecuteComplete {
        execution_id: String,
        outcome: ExecutionOutcome,
    },
    /// Acknowledgment of an interrupt request
    InterruptTriggered { success: bool },
    /// Engine output; the host tags it with the bound kernel ID
    Event { event: EventPayload },
}

/// Serialize a message and write it as one line
pub async fn write_line<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_message_tags() {
        let msg = HostMessage::ExecuteRequest {
            execution_id: "e1".to_string(),
            code: "print:hi".to_string(),
            parent: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execute_request");
        assert_eq!(json["execution_id"], "e1");
        assert!(json.get("parent").is_none());

        let back: HostMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_worker_event_roundtrip() {
        let msg = WorkerMessage::Event {
            event: EventPayload::Stream {
                name: crate::kernel::event::StreamName::Stderr,
                text: "oops".to_string(),
            },
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"event\""));
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_handshake_shapes() {
        let ok: WorkerMessage =
            serde_json::from_str(r#"{"type":"kernel_initialized","success":true}"#).unwrap();
        assert_eq!(
            ok,
            WorkerMessage::KernelInitialized {
                success: true,
                error: None
            }
        );

        let failed: WorkerMessage = serde_json::from_str(
            r#"{"type":"kernel_initialized","success":false,"error":"no engine"}"#,
        )
        .unwrap();
        assert!(matches!(
            failed,
            WorkerMessage::KernelInitialized { success: false, error: Some(e) } if e == "no engine"
        ));
    }
}
