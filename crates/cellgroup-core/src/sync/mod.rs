//! Offline sync engine.
//!
//! The `SyncEngine` owns the operation queue. Mutations go through
//! `submit`, which applies them right away when possible and queues them
//! otherwise. A drain replays the queue in creation order once the network
//! is back:
//!
//! ```text
//!  idle ──trigger──► syncing ──► success ──► idle
//!                       │
//!                       └──────► error ────► idle
//! ```
//!
//! Only one drain runs at a time. Status changes, including pending-count
//! changes, are pushed to subscribers.

pub mod engine;
pub mod status;

pub use engine::{SubmitOutcome, SyncEngine, SyncError, SyncOptions};
pub use status::{DrainOutcome, DrainReport, SyncState, SyncStatus, SyncTrigger};
