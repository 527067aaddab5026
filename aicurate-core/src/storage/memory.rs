//! In-memory blob store for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Mutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::{error::StorageError, traits::AtomicBlobStore};

/// Blob store backed by a `HashMap`. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    #[cfg(test)]
    fail_writes: AtomicBool,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, to exercise rollback paths.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl AtomicBlobStore for InMemoryBlobStore {
    fn read(&self, key: String) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self
            .blobs
            .lock()
            .map_err(|_| StorageError::BlobStore("mutex poisoned".to_string()))?;
        Ok(guard.get(&key).cloned())
    }

    fn write_atomic(&self, key: String, bytes: Vec<u8>) -> Result<(), StorageError> {
        #[cfg(test)]
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::BlobStore("write disabled".to_string()));
        }
        self.blobs
            .lock()
            .map_err(|_| StorageError::BlobStore("mutex poisoned".to_string()))?
            .insert(key, bytes);
        Ok(())
    }

    fn delete(&self, key: String) -> Result<(), StorageError> {
        self.blobs
            .lock()
            .map_err(|_| StorageError::BlobStore("mutex poisoned".to_string()))?
            .remove(&key);
        Ok(())
    }
}
