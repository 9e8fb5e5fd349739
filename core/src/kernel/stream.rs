//! Execute-stream bridge
//!
//! Adapts an engine's execute call plus a transient event-bus subscription
//! into an ordered async sequence of events terminated by a final status.
//!
//! Events are buffered per stream in an unbounded queue with a soft cap:
//! consumers that pause never stall the emitter, and past the cap new events
//! are dropped with a warning.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::error::{KernelHubError, Result};

use super::engine::ExecutionOutcome;
use super::event::{EventBus, EventKind, KernelEvent, SubscriptionId};
use super::types::KernelId;

/// One element of an execute stream: events in arrival order, then exactly
/// one terminal item
#[derive(Debug)]
pub enum ExecuteStreamItem {
    Event(KernelEvent),
    /// Terminal: the execute call settled and the queue is drained
    Completed(ExecutionOutcome),
    /// Terminal: timeout, destroyed kernel, or an execute failure
    Failed(KernelHubError),
}

impl ExecuteStreamItem {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecuteStreamItem::Event(_))
    }
}

/// Boxed stream type returned by the manager
pub type ExecuteStream = Pin<Box<dyn Stream<Item = ExecuteStreamItem> + Send>>;

pub(crate) struct StreamSettings {
    pub timeout: Duration,
    pub buffer_cap: usize,
}

/// Removes the transient subscriptions and runs the caller's cleanup when the
/// stream is dropped or finishes, whichever comes first
struct StreamGuard {
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.bus.unsubscribe(subscription);
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Bridge an execute call and the bus into an ordered event stream.
///
/// `start` is invoked only after every listener is registered, so no event
/// between the execute start and the first poll is lost. `cleanup` runs
/// exactly once, on completion or consumer cancellation.
pub(crate) fn bridge(
    bus: Arc<EventBus>,
    kernel_id: KernelId,
    start: impl FnOnce() -> JoinHandle<Result<ExecutionOutcome>>,
    settings: StreamSettings,
    cleanup: impl FnOnce() + Send + 'static,
) -> ExecuteStream {
    let (tx, mut rx) = mpsc::unbounded_channel::<KernelEvent>();
    let queued = Arc::new(AtomicUsize::new(0));

    // One transient listener per kind; all feed the same ordered queue. The
    // listeners hold the only senders, so destroying the kernel (which drops
    // its listeners) closes the queue.
    let mut subscriptions = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let tx = tx.clone();
        let queued = queued.clone();
        let cap = settings.buffer_cap;
        subscriptions.push(bus.on_kernel(
            kernel_id.clone(),
            kind,
            Arc::new(move |event: &KernelEvent| {
                if queued.load(Ordering::Relaxed) >= cap {
                    warn!(kernel = %event.kernel_id, "stream buffer cap reached, dropping event");
                    return;
                }
                queued.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(event.clone());
            }),
        ));
    }
    drop(tx);

    let guard = StreamGuard {
        bus,
        subscriptions,
        cleanup: Some(Box::new(cleanup)),
    };
    let execute = start();

    let stream = async_stream::stream! {
        // Moved in so consumer cancellation tears everything down.
        let _guard = guard;
        let mut execute = execute;
        let deadline = sleep(settings.timeout);
        tokio::pin!(deadline);
        let queued = queued;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            queued.fetch_sub(1, Ordering::Relaxed);
                            yield ExecuteStreamItem::Event(event);
                        }
                        None => {
                            // Every sender dropped: the kernel was destroyed
                            // out from under the stream.
                            execute.abort();
                            yield ExecuteStreamItem::Failed(
                                KernelHubError::StreamInterrupted {
                                    id: kernel_id.to_string(),
                                },
                            );
                            return;
                        }
                    }
                }
                result = &mut execute => {
                    // Engines emit synchronously before execute settles, so
                    // everything for this run is already queued; drain it.
                    while let Ok(event) = rx.try_recv() {
                        queued.fetch_sub(1, Ordering::Relaxed);
                        yield ExecuteStreamItem::Event(event);
                    }
                    match result {
                        Ok(Ok(outcome)) => yield ExecuteStreamItem::Completed(outcome),
                        Ok(Err(err)) => yield ExecuteStreamItem::Failed(err),
                        Err(join) => yield ExecuteStreamItem::Failed(
                            KernelHubError::ExecutionFailed {
                                reason: format!("execute task failed: {}", join),
                            },
                        ),
                    }
                    return;
                }
                _ = &mut deadline => {
                    execute.abort();
                    yield ExecuteStreamItem::Failed(KernelHubError::StreamTimeout {
                        timeout_ms: settings.timeout.as_millis() as u64,
                    });
                    return;
                }
            }
        }
    };

    Box::pin(stream)
}
