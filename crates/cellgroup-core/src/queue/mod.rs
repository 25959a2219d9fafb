//! Durable queue of mutations waiting to reach the remote store.
//!
//! The queue is a single JSON document persisted through a `KeyValueStore`.
//! Every mutation builds the next document, writes it, and only then swaps
//! it in memory, so a failed write leaves both copies unchanged.

pub mod store;

pub use store::{OperationQueue, LAST_SYNC_KEY, QUEUE_KEY};
