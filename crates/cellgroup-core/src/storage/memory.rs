use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, StorageResult};

/// In-process store. Contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries().remove(key);
        Ok(())
    }
}
