use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::observe::{Listeners, Subscription};
use crate::sync::SyncTrigger;

use super::{ProbeError, ReachabilityProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub online: bool,
}

/// Last known reachability plus transition listeners.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    // Serializes transitions so listeners see them in order
    transition: Mutex<()>,
    listeners: Listeners<ConnectivityState>,
    sync_trigger: Mutex<Option<mpsc::UnboundedSender<SyncTrigger>>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            transition: Mutex::new(()),
            listeners: Listeners::new(),
            sync_trigger: Mutex::new(None),
        }
    }

    pub fn current_state(&self) -> ConnectivityState {
        ConnectivityState {
            online: self.is_online(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, listener: impl Fn(&ConnectivityState) + Send + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Receiver for every transition from now on.
    pub fn receiver(&self) -> broadcast::Receiver<ConnectivityState> {
        self.listeners.receiver()
    }

    /// Signal `trigger` every time the network comes back.
    pub fn register_sync_trigger(&self, trigger: mpsc::UnboundedSender<SyncTrigger>) {
        *self
            .sync_trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trigger);
    }

    /// Record an observed state. Listeners are notified only on change.
    pub fn report(&self, online: bool) {
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        info!(online, "Connectivity changed");
        self.listeners.emit(&ConnectivityState { online });

        if online {
            let trigger = self
                .sync_trigger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(tx) = trigger.as_ref() {
                if tx.send(SyncTrigger::ConnectivityRestored).is_err() {
                    warn!("Sync engine is no longer listening for triggers");
                }
            }
        }
    }

    /// Record a probe result. A failed probe leaves the state unchanged.
    pub fn observe(&self, result: Result<bool, ProbeError>) {
        match result {
            Ok(online) => self.report(online),
            Err(e) => debug!(error = %e, "Reachability check failed, keeping last state"),
        }
    }

    /// Poll `probe` every `interval` until the monitor is dropped or the
    /// returned task is aborted.
    pub fn spawn_polling(
        self: &Arc<Self>,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = probe.check().await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.observe(result),
                    None => break,
                }
            }
            debug!("Connectivity polling stopped");
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
