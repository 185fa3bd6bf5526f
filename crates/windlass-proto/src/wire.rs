//! Newline-delimited JSON frames for the pool ↔ worker socket.
//!
//! Every request carries a caller-assigned id; responses echo it. A call
//! produces exactly one `Value` or `Exception`; a stream produces zero or
//! more `Chunk` frames terminated by `StreamDone` or `StreamError`.

use serde::{Deserialize, Serialize};
use windlass_types::WorkerRuntimeConfig;

/// First frame a worker writes after connecting, before any request is
/// accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHello {
    pub worker_index: usize,
    pub pid: u32,
}

/// Which kernel an `Install` request places into the worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kernel", rename_all = "snake_case")]
pub enum KernelSpec {
    /// The main session kernel: one model replica plus per-session
    /// message logs.
    Session { config: WorkerRuntimeConfig },
    /// The summarisation kernel.
    Summarizer { config: WorkerRuntimeConfig },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRequest {
    /// Deterministic warm-up; must complete before any kernel install.
    Warmup { id: u64 },
    /// Install a kernel; answered with `Value {"object": <id>}`.
    Install { id: u64, spec: KernelSpec },
    /// Invoke a method on an installed kernel object.
    Call {
        id: u64,
        object: u64,
        method: String,
        args: serde_json::Value,
    },
    /// Open a streaming method; chunks share the request id.
    StreamOpen {
        id: u64,
        object: u64,
        method: String,
        args: serde_json::Value,
    },
    /// Ask the remote generator for stream `id` to stop (best-effort).
    StreamCancel { id: u64 },
    /// Liveness probe.
    Health { id: u64 },
    /// Drain and exit cleanly.
    Shutdown,
}

impl WireRequest {
    pub fn id(&self) -> Option<u64> {
        match self {
            WireRequest::Warmup { id }
            | WireRequest::Install { id, .. }
            | WireRequest::Call { id, .. }
            | WireRequest::StreamOpen { id, .. }
            | WireRequest::StreamCancel { id }
            | WireRequest::Health { id } => Some(*id),
            WireRequest::Shutdown => None,
        }
    }
}

/// A structured exception crossing the worker boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireException {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl WireException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireResponse {
    /// Successful call result.
    Value { id: u64, value: serde_json::Value },
    /// Call failed with a structured exception.
    Exception { id: u64, exception: WireException },
    /// One streamed chunk.
    Chunk { id: u64, value: serde_json::Value },
    /// Stream completed normally; no further frames for this id.
    StreamDone { id: u64 },
    /// Stream terminated with an error; no further frames for this id.
    StreamError { id: u64, exception: WireException },
    /// Health probe reply.
    Pong {
        id: u64,
        worker_index: usize,
        sessions: usize,
        uptime_ms: u64,
    },
}

impl WireResponse {
    pub fn id(&self) -> u64 {
        match self {
            WireResponse::Value { id, .. }
            | WireResponse::Exception { id, .. }
            | WireResponse::Chunk { id, .. }
            | WireResponse::StreamDone { id }
            | WireResponse::StreamError { id, .. }
            | WireResponse::Pong { id, .. } => *id,
        }
    }
}

/// Encode a frame as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trips_through_a_line() {
        let req = WireRequest::Call {
            id: 7,
            object: 1,
            method: "decode".to_owned(),
            args: serde_json::json!({"session_id": "s"}),
        };
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        let back: WireRequest = serde_json::from_str(line.trim_end()).unwrap();
        match back {
            WireRequest::Call { id, object, method, .. } => {
                assert_eq!(id, 7);
                assert_eq!(object, 1);
                assert_eq!(method, "decode");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn responses_echo_their_request_id() {
        let resp = WireResponse::StreamError {
            id: 9,
            exception: WireException::new("decode_failed", "boom"),
        };
        assert_eq!(resp.id(), 9);
        let line = encode_line(&resp).unwrap();
        let back: WireResponse = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back.id(), 9);
    }
}
