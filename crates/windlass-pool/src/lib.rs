//! The worker pool: lifecycle of the worker processes that own the model
//! replicas, and the only path by which the control plane reaches them.
//!
//! The pool spawns one process per worker slot, runs the deterministic
//! warm-up, installs kernels, and then routes calls and streams to the
//! per-worker connection actors. Worker crashes surface as typed errors
//! carrying the exit code; the pool never silently retries, because
//! session affinity makes retry a scheduler decision.

mod client;
mod handle;
mod pool;
mod shared;
mod spawn;

pub use client::{PoolStream, StreamFrame};
pub use handle::KernelHandle;
pub use pool::{AuxKind, WorkerHealth, WorkerPool};
pub use shared::SharedSlot;
