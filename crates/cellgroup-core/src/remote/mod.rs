//! Remote store access.
//!
//! This module provides the `RemoteStore` trait the sync engine executes
//! queued operations through, and `RestRemote`, its implementation for a
//! PostgREST-style backend (`/rest/v1/<table>`) authenticated with an API
//! key.
//!
//! Every failure is a `RemoteError`, which classifies itself as transient
//! (worth retrying) or permanent (needs the user to change something).

pub mod client;
pub mod error;

pub use client::{RemoteStore, RestRemote};
pub use error::{FailureKind, RemoteError};
