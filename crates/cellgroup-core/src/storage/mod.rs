//! On-device key-value storage.
//!
//! The operation queue, the last-sync timestamp and cached reads are all
//! persisted through the `KeyValueStore` trait under fixed keys:
//!
//! - `FileStore`: one file per key, replaced atomically on every write
//! - `MemoryStore`: process-local map, for tests and ephemeral sessions

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored data is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// String key-value store backing the queue and cache.
///
/// `set` must either fully replace the value or leave the previous one in
/// place; readers never observe a partial write.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    fn remove(&self, key: &str) -> StorageResult<()>;
}
