//! In-worker code: the model-runtime seam, the session kernel that owns
//! one model replica plus per-session message logs, the summarisation
//! kernel, and the host that dispatches wire requests onto them.
//!
//! Nothing in this crate talks to a socket; the worker binary wires a
//! [`host::KernelHost`] to its connection and the pool does the rest.

pub mod host;
pub mod runtime;
pub mod session;
pub mod summarize;
pub mod thinking;
pub mod truncate;

mod error;

pub use error::KernelError;
pub use runtime::{build_runtime, FinishReason, GenerateUsage, ModelRuntime, RuntimeError};
pub use session::SessionKernel;
pub use summarize::SummarizerKernel;
