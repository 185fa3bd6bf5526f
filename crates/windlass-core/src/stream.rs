//! The public, cancellable completion stream.
//!
//! A forwarding task translates kernel stream events into typed
//! [`CompletionEvent`]s. Cancellation propagates to the remote generator
//! but is best-effort: chunks already in flight still arrive before the
//! terminal event. Finalisation is the caller's job: exactly one of the
//! scheduler's `finalize_*` methods must be invoked when consumption
//! ends, so counters, session phase, and the context-wind monitor stay
//! consistent.

use tokio::sync::{mpsc, watch};
use tracing::debug;
use windlass_pool::{PoolStream, StreamFrame};
use windlass_proto::StreamEvent;
use windlass_types::{ControlError, SessionId};

/// One event on a public completion stream.
#[derive(Clone, Debug)]
pub enum CompletionEvent {
    Delta {
        delta: String,
    },
    Done {
        finish_reason: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        prefill_ms: u64,
        decode_ms: u64,
        text: String,
        thinking: String,
    },
    Error {
        error: ControlError,
    },
}

/// An opaque, cancellable stream of completion events.
pub struct CompletionStream {
    events: mpsc::Receiver<CompletionEvent>,
    cancel_tx: watch::Sender<bool>,
}

impl CompletionStream {
    /// Wrap a pool stream in a forwarding task and return the public end.
    pub(crate) fn spawn(sid: SessionId, pool_stream: PoolStream) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(forward(sid, pool_stream, events_tx, cancel_rx));
        Self {
            events: events_rx,
            cancel_tx,
        }
    }

    /// Receive the next event; `None` after the terminal event.
    pub async fn recv(&mut self) -> Option<CompletionEvent> {
        self.events.recv().await
    }

    /// Ask the remote generator to stop. Events already buffered may
    /// still be delivered before the stream ends.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

async fn forward(
    sid: SessionId,
    mut pool_stream: PoolStream,
    events_tx: mpsc::Sender<CompletionEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = pool_stream.recv() => match frame {
                Some(StreamFrame::Chunk(value)) => {
                    match serde_json::from_value::<StreamEvent>(value) {
                        Ok(event) => {
                            let terminal = matches!(
                                event,
                                StreamEvent::Done { .. } | StreamEvent::Error { .. }
                            );
                            let event = translate(&sid, event);
                            if events_tx.send(event).await.is_err() {
                                // Receiver gone; stop the remote generator.
                                pool_stream.cancel().await;
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "undecodable stream chunk");
                        }
                    }
                }
                Some(StreamFrame::Done) | None => return,
                Some(StreamFrame::Error(error)) => {
                    let _ = events_tx.send(CompletionEvent::Error { error }).await;
                    return;
                }
            },
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    pool_stream.cancel().await;
                    // Keep draining: buffered chunks and the terminal
                    // frame still arrive.
                }
            }
        }
    }
}

fn translate(sid: &SessionId, event: StreamEvent) -> CompletionEvent {
    match event {
        StreamEvent::Delta { delta } => CompletionEvent::Delta { delta },
        StreamEvent::Done {
            finish_reason,
            prompt_tokens,
            completion_tokens,
            prefill_ms,
            decode_ms,
            text,
            thinking,
        } => CompletionEvent::Done {
            finish_reason,
            prompt_tokens,
            completion_tokens,
            prefill_ms,
            decode_ms,
            text,
            thinking,
        },
        StreamEvent::Error { error, traceback } => CompletionEvent::Error {
            error: ControlError::DecodeFailed {
                sid: sid.clone(),
                reason: match traceback {
                    Some(traceback) => format!("{error}\n{traceback}"),
                    None => error,
                },
            },
        },
    }
}
