//! The control-plane error taxonomy.
//!
//! Kinds are stable and transport-agnostic: preconditions fail before any
//! worker call, pool transport faults propagate unchanged, and the
//! scheduler classifies every terminal outcome into exactly one of these.

use thiserror::Error;

use crate::session::SessionId;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ControlError {
    /// Operation issued before pool startup completed.
    #[error("worker pool is not ready")]
    PoolNotReady,

    /// Kernel installation or weight loading failed.
    #[error("model load failed: {message}")]
    ModelLoadFailed { message: String },

    /// Scheduler lookup miss.
    #[error("session {sid} not found")]
    SessionNotFound { sid: SessionId },

    /// Per-worker session cap exceeded on creation.
    #[error("worker {index} is full")]
    WorkerFull { index: usize },

    /// The prompt will not fit into the remaining context budget.
    #[error("context overflow for session {sid}: {used} of {max} tokens used")]
    ContextOverflow { sid: SessionId, used: u32, max: u32 },

    /// Terminal per-request fault during prefill.
    #[error("prefill failed for session {sid}: {reason}")]
    PrefillFailed { sid: SessionId, reason: String },

    /// Terminal per-request fault during decode.
    #[error("decode failed for session {sid}: {reason}")]
    DecodeFailed { sid: SessionId, reason: String },

    /// The session was evicted.
    #[error("session {sid} was evicted")]
    Evicted { sid: SessionId },

    /// A pool call or stream exceeded its deadline.
    #[error("operation timed out{}", fmt_sid(.sid))]
    Timeout { sid: Option<SessionId> },

    /// A worker process exited while servicing a request.
    #[error("worker {index} crashed{}", fmt_exit_code(.exit_code))]
    WorkerCrashed {
        index: usize,
        exit_code: Option<i32>,
    },

    /// A structured exception crossed the worker boundary.
    #[error("worker {index}: {kind}: {message}")]
    KernelException {
        index: usize,
        kind: String,
        message: String,
        traceback: Option<String>,
    },

    /// The worker's transport channel is gone without a recorded exit.
    #[error("worker is unreachable")]
    WorkerUnreachable,

    /// The pool is draining and no longer accepts requests.
    #[error("worker pool is shutting down")]
    PoolShuttingDown,

    /// The configuration failed validation at startup.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl ControlError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ControlError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Attach a session id to faults that acquire one only at the
    /// scheduler layer (the pool reports timeouts without one).
    pub fn with_session(self, sid: &SessionId) -> Self {
        match self {
            ControlError::Timeout { sid: None } => ControlError::Timeout {
                sid: Some(sid.clone()),
            },
            other => other,
        }
    }

    /// A description safe to render to end users: worker-index prefixes
    /// and traceback bodies are stripped. The full detail stays available
    /// through `Display` for the log.
    pub fn user_message(&self) -> String {
        match self {
            ControlError::KernelException { message, .. } => message.clone(),
            ControlError::WorkerCrashed { .. } => {
                "the inference worker exited unexpectedly".to_owned()
            }
            ControlError::WorkerUnreachable => {
                "the inference worker is unreachable".to_owned()
            }
            other => other.to_string(),
        }
    }

    /// Transport faults originate below the scheduler and are surfaced
    /// unchanged.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ControlError::WorkerCrashed { .. }
                | ControlError::KernelException { .. }
                | ControlError::WorkerUnreachable
                | ControlError::PoolShuttingDown
                | ControlError::Timeout { .. }
        )
    }
}

fn fmt_sid(sid: &Option<SessionId>) -> String {
    match sid {
        Some(sid) => format!(" for session {sid}"),
        None => String::new(),
    }
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " (killed by signal)".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_strips_worker_detail() {
        let err = ControlError::KernelException {
            index: 3,
            kind: "ValueError".to_owned(),
            message: "prompt is empty".to_owned(),
            traceback: Some("frame 1\nframe 2".to_owned()),
        };
        let user = err.user_message();
        assert_eq!(user, "prompt is empty");
        assert!(!user.contains("worker 3"));
        assert!(!user.contains("frame 1"));
        // The log-facing rendering keeps the worker prefix.
        assert!(err.to_string().contains("worker 3"));
    }

    #[test]
    fn timeout_gains_session_id_at_the_scheduler() {
        let sid = SessionId::new();
        let err = ControlError::Timeout { sid: None }.with_session(&sid);
        assert_eq!(err, ControlError::Timeout { sid: Some(sid) });
    }
}
