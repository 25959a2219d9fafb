//! Read-through cache for remote data.
//!
//! This module provides `ReadThroughCache`, which keeps the last fetched
//! copy of each remote collection so screens render offline. Entries are
//! keyed `<class>:<scope>` (for example `members:c1`) and stored as JSON
//! through the same `KeyValueStore` as the operation queue.
//!
//! An entry is stale once it is older than 60 minutes or after the sync
//! engine applied a change to its entity class. Stale entries stay
//! readable until a fresh fetch replaces them.

pub mod manager;

pub use crate::utils::format_last_sync;
pub use manager::{cache_key, CacheRead, CachedData, ReadThroughCache};
