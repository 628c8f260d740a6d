use super::{StagedMap, Storage};
use crate::error::StateError;

/// In-memory storage; used by tests and ephemeral nodes
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: StagedMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of committed keys
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
}

impl Storage for MemoryStorage {
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
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.discard();
    }
}
