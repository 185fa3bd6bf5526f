use serde::{Deserialize, Serialize};

/// Typed reference to a kernel object living inside one worker process.
///
/// Owned by the pool and lent to the scheduler; a handle stays valid
/// until the pool shuts down or the worker crashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelHandle {
    /// Index of the worker process hosting the object.
    pub worker: usize,
    /// Object id assigned by the worker at kernel install.
    pub object: u64,
}

impl KernelHandle {
    pub fn new(worker: usize, object: u64) -> Self {
        Self { worker, object }
    }
}
