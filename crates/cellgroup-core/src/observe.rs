//! Fan-out of status and connectivity changes.
//!
//! Values are published on a `tokio::sync::broadcast` channel. Async
//! consumers take a receiver directly; callback consumers get a task that
//! forwards every value to their callback until the `Subscription` is
//! dropped.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Values buffered per receiver before a slow one starts skipping.
const CHANNEL_CAPACITY: usize = 64;

pub struct Listeners<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Listeners<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Receiver for every value emitted from now on, in emission order.
    pub fn receiver(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Call `listener` with every value emitted from now on.
    ///
    /// Must be called inside a tokio runtime. The callback runs on a
    /// spawned task, so it may itself subscribe or emit.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + 'static) -> Subscription {
        let mut rx = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => listener(&value),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Listener fell behind, skipping notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Publish `value` to every receiver and listener.
    pub fn emit(&self, value: &T) {
        // Err only means nobody is listening
        let _ = self.sender.send(value.clone());
    }

    pub fn len(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered listener. The listener stops when the handle is
/// dropped or `unsubscribe` is called.
#[must_use = "dropping a Subscription unsubscribes its listener"]
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
