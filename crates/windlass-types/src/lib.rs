//! Shared value types for the windlass inference control plane.
//!
//! Everything that crosses a crate boundary lives here: configuration,
//! sampling parameters, chat messages, session identity and phase, the
//! context-wind thresholds, and the control-plane error taxonomy.

mod config;
mod error;
mod params;
mod session;
mod threshold;
pub mod tokens;

pub use config::{InferenceConfig, RuntimeKind, WorkerRuntimeConfig};
pub use error::{ControlError, ControlResult};
pub use params::SamplingParams;
pub use session::{ChatMessage, Role, SessionId, SessionPhase};
pub use threshold::ContextThreshold;
