//! Keyed persistence adapter.
//!
//! Binds a storage key, a serialization format and a load-on-init default to
//! a state type, so stores mutate plain in-memory values and never touch the
//! blob store directly. The on-disk shape is `{"state": …, "version": N}`.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    error::{StorageError, StorageResult},
    traits::AtomicBlobStore,
};

const ENVELOPE_VERSION: u32 = 0;

#[derive(Serialize, Deserialize)]
struct Envelope<S> {
    state: S,
    version: u32,
}

/// A value of type `T` persisted under a fixed key.
pub struct Persisted<T> {
    key: String,
    store: Arc<dyn AtomicBlobStore>,
    _state: PhantomData<fn() -> T>,
}

impl<T> Persisted<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Binds `key` in `store` to the state type `T`.
    pub fn new(key: impl Into<String>, store: Arc<dyn AtomicBlobStore>) -> Self {
        Self {
            key: key.into(),
            store,
            _state: PhantomData,
        }
    }

    /// Returns the storage key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loads the persisted state, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails, the document is malformed, or it
    /// was written by a newer envelope version.
    pub fn load(&self) -> StorageResult<Option<T>> {
        let Some(bytes) = self.store.read(self.key.clone())? else {
            return Ok(None);
        };
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        if envelope.version > ENVELOPE_VERSION {
            return Err(StorageError::UnsupportedEnvelopeVersion(envelope.version));
        }
        Ok(Some(envelope.state))
    }

    /// Loads the persisted state or, when nothing was stored yet, the default.
    ///
    /// # Errors
    ///
    /// See [`Persisted::load`].
    pub fn load_or_else(&self, default: impl FnOnce() -> T) -> StorageResult<T> {
        Ok(self.load()?.unwrap_or_else(default))
    }

    /// Persists `state`, replacing the previous document atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, state: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(&Envelope {
            state,
            version: ENVELOPE_VERSION,
        })
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.store.write_atomic(self.key.clone(), bytes)
    }

    /// Removes the persisted document.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> StorageResult<()> {
        self.store.delete(self.key.clone())
    }
}
