//! The inference control plane: session scheduler, context-wind monitor,
//! and the memory layer that summarises and rehydrates conversations
//! before they overflow the context window.
//!
//! The entry point is [`Scheduler::start`], which brings up the worker
//! pool and returns the handle every collaborator talks to.

pub mod memory;
pub mod monitor;
pub mod scheduler;
pub mod stream;

pub use memory::{plan_rehydration, strip_document_blocks, RehydrationInput, RehydrationPlan};
pub use monitor::{ContextWindMonitor, Crossing};
pub use scheduler::{
    BatchRequest, CompletionResult, Scheduler, SchedulerStats, SessionInfo,
};
pub use stream::{CompletionEvent, CompletionStream};

pub use windlass_types::{
    ChatMessage, ContextThreshold, ControlError, ControlResult, InferenceConfig, Role,
    RuntimeKind, SamplingParams, SessionId, SessionPhase,
};
