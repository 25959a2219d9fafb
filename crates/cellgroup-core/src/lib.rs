//! Offline-first sync core for the cell group app.
//!
//! Writes made while offline are captured as typed [`Operation`]s in a
//! durable [`OperationQueue`] and replayed in order by the [`SyncEngine`]
//! once the [`ConnectivityMonitor`] sees the network again. Reads go
//! through a [`ReadThroughCache`] so screens keep working without a
//! connection.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod models;
pub mod observe;
pub mod operation;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod utils;

pub use cache::{cache_key, CacheRead, ReadThroughCache};
pub use config::{Config, SyncSettings};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe, ReachabilityProbe};
pub use observe::Subscription;
pub use operation::{Operation, OperationKind, OperationStatus, QueuedOperation};
pub use queue::OperationQueue;
pub use remote::{RemoteError, RemoteStore, RestRemote};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use sync::{
    DrainOutcome, DrainReport, SubmitOutcome, SyncEngine, SyncError, SyncOptions, SyncState,
    SyncStatus, SyncTrigger,
};
