//! Per-worker connection actor.
//!
//! One actor per worker process owns the socket's write half and the map
//! of in-flight requests. Responses are matched to callers by request id;
//! a connection loss or child exit fails every pending request with a
//! typed crash error. Requests on one worker are answered in the order
//! the worker produces them; the actor imposes no ordering of its own.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit};
use tracing::{debug, warn};
use windlass_proto::wire::encode_line;
use windlass_proto::{WireRequest, WireResponse};
use windlass_types::ControlError;

/// Exit status observed by the child watcher: `None` while running,
/// `Some(code)` after exit (`code` is `None` when killed by a signal).
pub(crate) type ExitStatusCell = Option<Option<i32>>;

/// One frame delivered on a pool stream.
#[derive(Debug)]
pub enum StreamFrame {
    /// A decoded chunk, in kernel emission order.
    Chunk(serde_json::Value),
    /// The remote generator finished; no further frames follow.
    Done,
    /// Terminal failure (remote exception, crash, or timeout).
    Error(ControlError),
}

pub(crate) enum PendingReply {
    Call(oneshot::Sender<Result<WireResponse, ControlError>>),
    Stream(mpsc::Sender<StreamFrame>),
}

pub(crate) enum ClientCommand {
    Request {
        frame: WireRequest,
        reply: PendingReply,
    },
    /// Ask the remote generator of stream `id` to stop (best-effort).
    CancelStream { id: u64 },
    /// Forget an in-flight request whose caller timed out.
    Abandon { id: u64 },
    /// Write the shutdown frame; the worker drains and exits.
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct WorkerClient {
    pub index: usize,
    cmd_tx: mpsc::Sender<ClientCommand>,
    exit_rx: watch::Receiver<ExitStatusCell>,
}

impl WorkerClient {
    /// Build a client over an established stream. `exit_rx` is fed by the
    /// child watcher; tests drive it by hand.
    pub fn from_stream(
        index: usize,
        stream: UnixStream,
        exit_rx: watch::Receiver<ExitStatusCell>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (read_half, write_half) = stream.into_split();
        let actor = ClientActor {
            index,
            write_half,
            pending: HashMap::new(),
            exit_rx: exit_rx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, read_half));
        Self {
            index,
            cmd_tx,
            exit_rx,
        }
    }

    pub async fn send(&self, command: ClientCommand) -> Result<(), ControlError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| self.disconnect_error())
    }

    /// Wait until the child's exit status is recorded, up to `timeout`.
    /// Returns `true` when the worker is known to have exited.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exit_rx = self.exit_rx.clone();
        if exit_rx.borrow().is_some() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while exit_rx.changed().await.is_ok() {
                if exit_rx.borrow().is_some() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// The error describing why this worker is gone.
    pub fn disconnect_error(&self) -> ControlError {
        match *self.exit_rx.borrow() {
            Some(exit_code) => ControlError::WorkerCrashed {
                index: self.index,
                exit_code,
            },
            None => ControlError::WorkerUnreachable,
        }
    }
}

struct ClientActor {
    index: usize,
    write_half: OwnedWriteHalf,
    pending: HashMap<u64, PendingReply>,
    exit_rx: watch::Receiver<ExitStatusCell>,
}

impl ClientActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCommand>, read_half: OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        let mut exit_rx = self.exit_rx.clone();
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) | Err(_) => {
                        self.fail_all();
                        break;
                    }
                },
                changed = exit_rx.changed() => {
                    if changed.is_err() || exit_rx.borrow().is_some() {
                        self.fail_all();
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the actor should stop.
    async fn handle_command(&mut self, command: ClientCommand) -> bool {
        match command {
            ClientCommand::Request { frame, reply } => {
                let id = frame.id().expect("requests always carry an id");
                match self.write_frame(&frame).await {
                    Ok(()) => {
                        self.pending.insert(id, reply);
                    }
                    Err(()) => {
                        let err = self.crash_error();
                        match reply {
                            PendingReply::Call(tx) => {
                                let _ = tx.send(Err(err));
                            }
                            PendingReply::Stream(tx) => {
                                let _ = tx.try_send(StreamFrame::Error(err));
                            }
                        }
                        self.fail_all();
                        return false;
                    }
                }
            }
            ClientCommand::CancelStream { id } => {
                let _ = self.write_frame(&WireRequest::StreamCancel { id }).await;
            }
            ClientCommand::Abandon { id } => {
                self.pending.remove(&id);
            }
            ClientCommand::Shutdown => {
                let _ = self.write_frame(&WireRequest::Shutdown).await;
            }
        }
        true
    }

    async fn handle_line(&mut self, line: &str) {
        let response: WireResponse = match serde_json::from_str(line) {
            Ok(response) => response,
            Err(e) => {
                warn!(worker = self.index, error = %e, "undecodable frame from worker");
                return;
            }
        };
        let id = response.id();

        match response {
            WireResponse::Chunk { value, .. } => {
                let drop_stream = match self.pending.get(&id) {
                    Some(PendingReply::Stream(tx)) => {
                        tx.send(StreamFrame::Chunk(value)).await.is_err()
                    }
                    _ => false,
                };
                if drop_stream {
                    // Receiver went away; stop the remote generator.
                    debug!(worker = self.index, id, "stream receiver dropped; cancelling");
                    self.pending.remove(&id);
                    let _ = self.write_frame(&WireRequest::StreamCancel { id }).await;
                }
            }
            WireResponse::StreamDone { .. } => {
                if let Some(PendingReply::Stream(tx)) = self.pending.remove(&id) {
                    let _ = tx.send(StreamFrame::Done).await;
                }
            }
            WireResponse::StreamError { exception, .. } => {
                if let Some(PendingReply::Stream(tx)) = self.pending.remove(&id) {
                    let _ = tx
                        .send(StreamFrame::Error(ControlError::KernelException {
                            index: self.index,
                            kind: exception.kind,
                            message: exception.message,
                            traceback: exception.traceback,
                        }))
                        .await;
                }
            }
            other => {
                if let Some(reply) = self.pending.remove(&id) {
                    match reply {
                        PendingReply::Call(tx) => {
                            let _ = tx.send(Ok(other));
                        }
                        PendingReply::Stream(tx) => {
                            // A stream request was answered with a unary
                            // frame; treat it as a remote failure.
                            let err = match other {
                                WireResponse::Exception { exception, .. } => {
                                    ControlError::KernelException {
                                        index: self.index,
                                        kind: exception.kind,
                                        message: exception.message,
                                        traceback: exception.traceback,
                                    }
                                }
                                _ => ControlError::WorkerUnreachable,
                            };
                            let _ = tx.send(StreamFrame::Error(err)).await;
                        }
                    }
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &WireRequest) -> Result<(), ()> {
        let line = encode_line(frame).map_err(|_| ())?;
        self.write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|_| ())
    }

    fn crash_error(&self) -> ControlError {
        match *self.exit_rx.borrow() {
            Some(exit_code) => ControlError::WorkerCrashed {
                index: self.index,
                exit_code,
            },
            None => ControlError::WorkerCrashed {
                index: self.index,
                exit_code: None,
            },
        }
    }

    fn fail_all(&mut self) {
        let err = self.crash_error();
        warn!(worker = self.index, error = %err, "failing all in-flight requests");
        for (_, reply) in self.pending.drain() {
            match reply {
                PendingReply::Call(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                PendingReply::Stream(tx) => {
                    let _ = tx.try_send(StreamFrame::Error(err.clone()));
                }
            }
        }
    }
}

/// A lazily consumed decode stream backed by the worker socket.
///
/// Dropping the stream cancels the remote generator; already-buffered
/// chunks may still arrive before the terminal frame, so consumers should
/// read until `Done` or `Error`.
pub struct PoolStream {
    pub(crate) id: u64,
    pub(crate) frames: mpsc::Receiver<StreamFrame>,
    pub(crate) client: WorkerClient,
    pub(crate) timeout: Duration,
    pub(crate) _permit: Option<OwnedSemaphorePermit>,
}

impl PoolStream {
    /// Receive the next frame, or `None` once the stream is finished.
    /// A per-frame timeout surfaces as a terminal `Error` frame.
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        match tokio::time::timeout(self.timeout, self.frames.recv()).await {
            Ok(frame) => frame,
            Err(_) => Some(StreamFrame::Error(ControlError::Timeout { sid: None })),
        }
    }

    /// Ask the remote generator to stop. Best-effort: frames already in
    /// flight are still delivered before the terminal frame.
    pub async fn cancel(&self) {
        let _ = self
            .client
            .send(ClientCommand::CancelStream { id: self.id })
            .await;
    }
}
