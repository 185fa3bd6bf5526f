//! Wire layer shared by the pool and the worker processes.
//!
//! Three concerns live here:
//! - the newline-delimited JSON frames spoken over the per-worker
//!   Unix-domain socket ([`wire`]);
//! - the JSON result and stream-event shapes the scheduler depends on
//!   ([`shapes`]);
//! - the length-prefixed framing used by the shared-memory fast path
//!   ([`shm`]).

pub mod shapes;
pub mod shm;
pub mod wire;

pub use shapes::{
    CreateOutcome, CreateStatus, DecodeOutcome, PrefillOutcome, SessionSnapshot, StreamEvent,
    SummaryOutcome, TitleOutcome, WorkerStats,
};
pub use shm::{read_frame, write_frame, ShmFrameError};
pub use wire::{KernelSpec, WireException, WireRequest, WireResponse, WorkerHello};
