//! Platform interface for durable client state.

use super::error::StorageResult;

/// Atomic blob store for small documents keyed by name (e.g. `ai-credits`).
///
/// Mobile hosts implement this over their own durable storage (shared
/// preferences, keychain, local storage). A write must either fully replace
/// the previous value or leave it untouched.
#[uniffi::export(with_foreign)]
pub trait AtomicBlobStore: Send + Sync {
    /// Reads the blob stored under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, key: String) -> StorageResult<Option<Vec<u8>>>;

    /// Writes bytes atomically under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, key: String, bytes: Vec<u8>) -> StorageResult<()>;

    /// Deletes the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, key: String) -> StorageResult<()>;
}
