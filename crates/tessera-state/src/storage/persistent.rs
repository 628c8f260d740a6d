use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tessera_core::serialize;
use tracing::debug;

use super::{StagedMap, Storage};
use crate::error::StateError;

/// File-backed storage using a single snapshot file, rewritten atomically
/// (write to a temp file, then rename) on every commit.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    inner: StagedMap,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StateError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| StateError::Storage(e.to_string()))?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                serialize::from_bytes(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(FileStorage {
            path,
            inner: StagedMap::with_data(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_to_disk(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::Storage(e.to_string()))?;
        }

        let bytes = serialize::to_bytes(&self.inner.data)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| StateError::Storage(e.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StateError::Storage(e.to_string()))?;
        debug!("Flushed {} keys to {}", self.inner.data.len(), self.path.display());
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.inner.stage(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.inner.stage(key, None);
    }

    fn commit(&mut self) -> Result<(), StateError> {
        self.inner.apply();
        self.flush_to_disk()
    }

    fn rollback(&mut self) {
        self.inner.discard();
    }
}
