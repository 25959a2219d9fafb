//! Network reachability tracking.
//!
//! `ConnectivityMonitor` holds the last observed online/offline state and
//! notifies subscribers on every transition. A `ReachabilityProbe` feeds it
//! from a background poll; probe errors never change the state.

pub mod monitor;
pub mod probe;

pub use monitor::{ConnectivityMonitor, ConnectivityState};
pub use probe::{HttpProbe, ProbeError, ReachabilityProbe};
