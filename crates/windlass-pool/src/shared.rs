//! Shared-memory result slots.
//!
//! A slot is a fixed-size file in the pool's runtime directory, mapped
//! shared on both sides: the worker writes the framed result, the
//! scheduler reads it under a scoped borrow. One in-flight completion
//! per session keeps readers and the writer from overlapping.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use windlass_types::ControlError;

pub struct SharedSlot {
    path: PathBuf,
    map: Mmap,
    len: usize,
}

impl SharedSlot {
    pub(crate) fn create(dir: &Path, len: usize) -> Result<Self, ControlError> {
        let path = dir.join(format!("slot-{}.shm", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| shm_error(&path, "create", e))?;
        file.set_len(len as u64)
            .map_err(|e| shm_error(&path, "size", e))?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| shm_error(&path, "map", e))?;
        Ok(Self { path, map, len })
    }

    /// Path handed to the worker so it can map the same region.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the raw bytes under a scoped borrow; the borrow ends when
    /// `f` returns.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.map)
    }

    /// Remove the backing file. Also happens on drop, best-effort.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SharedSlot {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn shm_error(path: &Path, action: &str, e: std::io::Error) -> ControlError {
    ControlError::ModelLoadFailed {
        message: format!("shared slot {action} {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trips_worker_writes() {
        let dir = std::env::temp_dir();
        let slot = SharedSlot::create(&dir, 4096).unwrap();

        // Simulate the worker side: map the same file writable.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(slot.path())
            .unwrap();
        let mut writable = unsafe { memmap2::MmapMut::map_mut(&file) }.unwrap();
        let total = windlass_proto::write_frame(&mut writable, r#"{"x":1}"#).unwrap();
        writable.flush().unwrap();

        let payload = slot.with_bytes(|bytes| {
            windlass_proto::read_frame(bytes, total).map(str::to_owned)
        });
        assert_eq!(payload.unwrap(), r#"{"x":1}"#);
    }

    #[test]
    fn release_removes_the_backing_file() {
        let dir = std::env::temp_dir();
        let slot = SharedSlot::create(&dir, 64).unwrap();
        let path = slot.path().to_path_buf();
        assert!(path.exists());
        slot.release();
        assert!(!path.exists());
    }
}
