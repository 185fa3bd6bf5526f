use thiserror::Error;
use windlass_types::SessionId;

use crate::runtime::RuntimeError;

/// Errors raised by the in-worker kernels.
///
/// These never cross the process boundary as-is; the host converts them
/// into structured wire exceptions.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("session {sid} not found")]
    SessionNotFound { sid: SessionId },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("shared result buffer: {reason}")]
    SharedBuffer { reason: String },
}
