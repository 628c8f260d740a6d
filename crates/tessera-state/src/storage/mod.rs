pub mod memory;
pub mod persistent;

use std::collections::BTreeMap;

use crate::error::StateError;

/// Key-value storage with staged writes
pub trait Storage: Send + Sync {
    /// Get a value by key, pending writes included
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stage a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Stage a deletion
    fn delete(&mut self, key: &[u8]);

    /// Make staged writes durable
    fn commit(&mut self) -> Result<(), StateError>;

    /// Discard staged writes
    fn rollback(&mut self);

    fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Committed data plus an overlay of staged writes. `None` marks a deletion.
#[derive(Debug, Clone, Default)]
pub(crate) struct StagedMap {
    pub(crate) data: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StagedMap {
    pub(crate) fn with_data(data: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        StagedMap {
            data,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(staged) => staged.clone(),
            None => self.data.get(key).cloned(),
        }
    }

    pub(crate) fn stage(&mut self, key: &[u8], value: Option<&[u8]>) {
        self.pending.insert(key.to_vec(), value.map(<[u8]>::to_vec));
    }

    pub(crate) fn apply(&mut self) {
        for (key, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(v) => {
                    self.data.insert(key, v);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
    }

    pub(crate) fn discard(&mut self) {
        self.pending.clear();
    }
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
