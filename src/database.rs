//! Storage abstraction for snapshot checkpoints.
//!
//! The engine persists snapshots as opaque blobs under prefixed keys, so the
//! backend only needs a byte-oriented key-value contract. A memory
//! implementation covers tests; production deployments wrap their own store.

use crate::PoiError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe key-value storage used for snapshot checkpoints.
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PoiError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), PoiError>;

    /// Remove the value stored under `key`.
    fn delete(&self, key: &[u8]) -> Result<(), PoiError>;

    /// Check whether `key` holds a value.
    fn contains(&self, key: &[u8]) -> Result<bool, PoiError>;
}

/// Memory-backed store for tests.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Create a new store wrapped in an `Arc`.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PoiError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), PoiError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), PoiError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, PoiError> {
        Ok(self.entries.read().contains_key(key))
    }
}

/// A store that persists nothing, for setups where checkpointing is handled
/// elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopKeyValueStore;

impl KeyValueStore for NoopKeyValueStore {
    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, PoiError> {
        Ok(None)
    }

    fn put(&self, _key: &[u8], _value: Vec<u8>) -> Result<(), PoiError> {
        Ok(())
    }

    fn delete(&self, _key: &[u8]) -> Result<(), PoiError> {
        Ok(())
    }

    fn contains(&self, _key: &[u8]) -> Result<bool, PoiError> {
        Ok(false)
    }
}
