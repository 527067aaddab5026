//! File-backed blob store: one JSON document per key under a root directory.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{
    error::{StorageError, StorageResult},
    traits::AtomicBlobStore,
};

/// Stores each key as `<root>/<key>.json`. Writes go to a sibling temporary
/// file which is synced and then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::BlobStore(format!("invalid key {key:?}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

fn map_io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BlobStore(format!("{context}: {err}"))
}

impl AtomicBlobStore for FileBlobStore {
    fn read(&self, key: String) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(&key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io_err("read", &err)),
        }
    }

    fn write_atomic(&self, key: String, bytes: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(&key)?;
        fs::create_dir_all(&self.root).map_err(|err| map_io_err("create root", &err))?;

        let tmp = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(map_io_err("atomic write", &err));
        }
        Ok(())
    }

    fn delete(&self, key: String) -> StorageResult<()> {
        let path = self.path_for(&key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_err("delete", &err)),
        }
    }
}
