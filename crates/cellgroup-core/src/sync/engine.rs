use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ReadThroughCache;
use crate::connectivity::ConnectivityMonitor;
use crate::observe::{Listeners, Subscription};
use crate::operation::{Operation, OperationKind, OperationStatus, QueuedOperation};
use crate::queue::OperationQueue;
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::StorageError;

use super::status::{DrainOutcome, DrainReport, SyncState, SyncStatus, SyncTrigger};

/// Default number of attempts before an operation is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default bound on a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The local queue could not be read or written. The change was not
    /// saved and the user has to be told.
    #[error("Could not save change on this device: {0}")]
    Storage(#[from] StorageError),

    #[error("The server rejected this change ({kind})")]
    Rejected {
        kind: OperationKind,
        #[source]
        source: RemoteError,
    },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Attempts allowed per operation before it is marked failed.
    pub max_attempts: u32,
    /// Bound on each remote call. Exceeding it is a transient failure.
    pub request_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// What happened to a submitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The server confirmed the write.
    Applied,
    /// The write was saved locally and will be sent by a later drain.
    Queued(QueuedOperation),
}

/// What a drain pass did with one operation.
enum Settled {
    Applied,
    Deferred { lost_connection: bool },
    Rejected,
}

/// Resets the drain flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine<R: RemoteStore> {
    remote: R,
    queue: Mutex<OperationQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    cache: Option<Arc<ReadThroughCache>>,
    options: SyncOptions,
    draining: AtomicBool,
    // Set by every drain request; cleared when a pass starts
    drain_requested: AtomicBool,
    status: Mutex<SyncStatus>,
    listeners: Listeners<SyncStatus>,
    trigger: Mutex<Option<mpsc::UnboundedSender<SyncTrigger>>>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(
        remote: R,
        queue: OperationQueue,
        connectivity: Arc<ConnectivityMonitor>,
        options: SyncOptions,
    ) -> Self {
        let status = SyncStatus {
            state: SyncState::Idle,
            message: None,
            pending_count: queue.pending_count(),
            failed_count: queue.failed_count(),
            last_sync: queue.last_sync(),
        };

        Self {
            remote,
            queue: Mutex::new(queue),
            connectivity,
            cache: None,
            options,
            draining: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            status: Mutex::new(status),
            listeners: Listeners::new(),
            trigger: Mutex::new(None),
        }
    }

    /// Invalidate entries of `cache` whenever operations for their entity
    /// class reach the server.
    pub fn with_cache(mut self, cache: Arc<ReadThroughCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn queue(&self) -> MutexGuard<'_, OperationQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> MutexGuard<'_, SyncStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn status(&self) -> SyncStatus {
        self.current().clone()
    }

    /// Call `listener` with every status change. Needs a tokio runtime.
    pub fn subscribe(&self, listener: impl Fn(&SyncStatus) + Send + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Receiver for every status change from now on.
    pub fn status_receiver(&self) -> broadcast::Receiver<SyncStatus> {
        self.listeners.receiver()
    }

    pub fn pending_count(&self) -> usize {
        self.queue().pending_count()
    }

    pub fn list_pending(&self) -> Vec<QueuedOperation> {
        self.queue().list_pending()
    }

    pub fn list_failed(&self) -> Vec<QueuedOperation> {
        self.queue().list_failed()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.queue().last_sync()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Move to `state` and notify subscribers.
    fn publish(&self, state: SyncState, message: Option<String>) {
        let status = {
            let queue = self.queue();
            let mut current = self.current();
            *current = SyncStatus {
                state,
                message,
                pending_count: queue.pending_count(),
                failed_count: queue.failed_count(),
                last_sync: queue.last_sync(),
            };
            current.clone()
        };
        debug!(state = %status.state, pending = status.pending_count, "Sync status changed");
        self.listeners.emit(&status);
    }

    /// Push queue counters to subscribers if they moved.
    fn refresh_counts(&self) {
        let status = {
            let queue = self.queue();
            let mut current = self.current();
            let pending = queue.pending_count();
            let failed = queue.failed_count();
            let last_sync = queue.last_sync();
            if current.pending_count == pending
                && current.failed_count == failed
                && current.last_sync == last_sync
            {
                return;
            }
            current.pending_count = pending;
            current.failed_count = failed;
            current.last_sync = last_sync;
            current.clone()
        };
        self.listeners.emit(&status);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Apply a mutation, or queue it for later.
    ///
    /// The mutation is sent right away only when the device is online and
    /// nothing is queued ahead of it; otherwise it would overtake earlier
    /// writes. A transient failure queues it. A permanent failure is
    /// returned, since retrying would not help.
    pub async fn submit(&self, operation: Operation) -> Result<SubmitOutcome, SyncError> {
        let online = self.connectivity.is_online();
        let backlog = !self.queue().is_empty() || self.is_draining();

        if online && !backlog {
            match self.execute(&operation).await {
                Ok(()) => {
                    self.invalidate_classes([operation.entity_class()]);
                    self.record_sync();
                    return Ok(SubmitOutcome::Applied);
                }
                Err(e) if e.is_transient() => {
                    warn!(kind = %operation.kind(), error = %e, "Remote write failed, queueing");
                }
                Err(e) => {
                    warn!(kind = %operation.kind(), error = %e, "Remote write rejected");
                    return Err(SyncError::Rejected {
                        kind: operation.kind(),
                        source: e,
                    });
                }
            }
        }

        let queued = self.queue().enqueue(operation)?;
        self.refresh_counts();

        if online && backlog {
            self.send_trigger(SyncTrigger::Enqueued);
        }

        Ok(SubmitOutcome::Queued(queued))
    }

    /// Discard every operation that gave up. Returns how many were removed.
    pub fn clear_failed_operations(&self) -> Result<usize, SyncError> {
        let cleared = self.queue().clear_failed()?;
        self.refresh_counts();
        Ok(cleared)
    }

    /// Give every failed operation a fresh set of attempts.
    pub fn requeue_failed_operations(&self) -> Result<usize, SyncError> {
        let requeued = self.queue().requeue_failed()?;
        self.refresh_counts();
        if requeued > 0 && self.connectivity.is_online() {
            self.send_trigger(SyncTrigger::Manual);
        }
        Ok(requeued)
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// User-initiated drain.
    pub async fn force_sync(&self) -> Result<DrainOutcome, SyncError> {
        self.drain(SyncTrigger::Manual).await
    }

    /// Send every pending operation to the server, oldest first.
    ///
    /// Returns `AlreadyRunning` without doing anything if another drain is
    /// in flight; that drain then schedules a follow-up through the drain
    /// loop so work queued near its end is not stranded. An empty queue
    /// publishes no status change.
    pub async fn drain(&self, trigger: SyncTrigger) -> Result<DrainOutcome, SyncError> {
        if !self.connectivity.is_online() {
            debug!(?trigger, "Offline, skipping drain");
            return Ok(DrainOutcome::Offline);
        }

        self.drain_requested.store(true, Ordering::SeqCst);
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(?trigger, "Drain already in flight");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        // Requests made before this point are covered by this pass
        self.drain_requested.store(false, Ordering::SeqCst);

        let result = {
            let _guard = DrainGuard(&self.draining);
            self.drain_locked(trigger).await
        };

        if self.drain_requested.load(Ordering::SeqCst) && self.connectivity.is_online() {
            debug!("Drain requested while running, scheduling another");
            self.send_trigger(SyncTrigger::Enqueued);
        }

        result
    }

    async fn drain_locked(&self, trigger: SyncTrigger) -> Result<DrainOutcome, SyncError> {
        let has_work = self.queue().peek_next().is_some();
        if !has_work {
            return Ok(DrainOutcome::Empty);
        }

        info!(?trigger, pending = self.pending_count(), "Starting drain");
        self.publish(SyncState::Syncing, None);

        let mut touched = BTreeSet::new();
        let result = self.run_pass(&mut touched).await;
        self.invalidate_classes(touched);

        match result {
            Ok(report) => {
                let pending = self.pending_count();
                let message = report.summary(pending);
                let state = if report.is_success() {
                    self.record_sync();
                    SyncState::Success
                } else {
                    SyncState::Error
                };
                info!(?report, "Drain finished");
                self.publish(state, Some(message.clone()));
                self.publish(SyncState::Idle, Some(message));
                Ok(DrainOutcome::Completed(report))
            }
            Err(e) => {
                error!(error = %e, "Drain aborted by storage failure");
                let message = format!(
                    "Could not update saved changes; {} waiting to sync",
                    crate::utils::pluralize(self.pending_count(), "change")
                );
                self.publish(SyncState::Error, Some(message.clone()));
                self.publish(SyncState::Idle, Some(message));
                Err(e)
            }
        }
    }

    /// One pass over the queue. Operations run one at a time.
    async fn run_pass(&self, touched: &mut BTreeSet<&'static str>) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        let mut cursor: Option<u64> = None;
        // Entities with a deferred operation in this pass. Later operations
        // on them wait so they cannot overtake it.
        let mut deferred_entities: HashSet<String> = HashSet::new();

        loop {
            let next = match cursor {
                None => self.queue().peek_next(),
                Some(id) => self.queue().peek_next_after(id),
            };
            let Some(entry) = next else {
                break;
            };
            cursor = Some(entry.id);

            let entity = entry.operation.entity_key();
            if deferred_entities.contains(&entity) {
                debug!(id = entry.id, %entity, "Holding back operation behind deferred one");
                report.held_back += 1;
                continue;
            }

            if !self.connectivity.is_online() {
                report.interrupted = true;
                break;
            }

            self.queue().mark_in_flight(entry.id)?;
            let result = self.execute(&entry.operation).await;

            let settled = self.settle(&entry, result, &mut report);
            let lost_connection = match settled {
                Ok(Settled::Applied) => {
                    touched.insert(entry.operation.entity_class());
                    false
                }
                Ok(Settled::Deferred { lost_connection }) => {
                    deferred_entities.insert(entity);
                    lost_connection
                }
                Ok(Settled::Rejected) => false,
                Err(e) => {
                    // Keep the entry drainable for the rest of this session
                    self.queue().release(entry.id);
                    self.refresh_counts();
                    return Err(e);
                }
            };

            self.refresh_counts();
            if lost_connection {
                info!("Connection lost during drain");
                self.connectivity.report(false);
                report.interrupted = true;
                break;
            }
        }

        Ok(report)
    }

    /// Record the outcome of one remote call in the queue.
    fn settle(
        &self,
        entry: &QueuedOperation,
        result: Result<(), RemoteError>,
        report: &mut DrainReport,
    ) -> Result<Settled, SyncError> {
        match result {
            Ok(()) => {
                self.queue().mark_done(entry.id)?;
                report.applied += 1;
                debug!(id = entry.id, kind = %entry.kind(), "Operation applied");
                Ok(Settled::Applied)
            }
            Err(e) if e.is_transient() => {
                let status = self
                    .queue()
                    .mark_retry(entry.id, &e.to_string(), self.options.max_attempts)?;
                if status == Some(OperationStatus::Failed) {
                    warn!(id = entry.id, kind = %entry.kind(), error = %e, "Operation out of attempts");
                    report.exhausted += 1;
                } else {
                    debug!(id = entry.id, kind = %entry.kind(), error = %e, "Operation deferred");
                    report.deferred += 1;
                }
                Ok(Settled::Deferred {
                    lost_connection: e.is_connectivity_loss(),
                })
            }
            Err(e) => {
                warn!(id = entry.id, kind = %entry.kind(), error = %e, "Operation rejected");
                self.queue().mark_failed(entry.id, &e.to_string())?;
                report.rejected += 1;
                Ok(Settled::Rejected)
            }
        }
    }

    /// Run one remote call under the configured timeout.
    async fn execute(&self, operation: &Operation) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.options.request_timeout, self.remote.execute(operation)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.options.request_timeout.as_secs())),
        }
    }

    fn record_sync(&self) {
        if let Err(e) = self.queue().record_sync(Utc::now()) {
            warn!(error = %e, "Failed to persist last sync time");
        }
        self.refresh_counts();
    }

    fn invalidate_classes<'a>(&self, classes: impl IntoIterator<Item = &'a str>) {
        if let Some(cache) = &self.cache {
            for class in classes {
                cache.invalidate_class(class);
            }
        }
    }

    fn send_trigger(&self, trigger: SyncTrigger) {
        let sender = self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = sender.as_ref() {
            if tx.send(trigger).is_err() {
                warn!("Drain loop has stopped; trigger dropped");
            }
        }
    }
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
    /// Start the background drain loop and hook it up to the connectivity
    /// monitor. Leftovers from a previous session are drained right away
    /// when online.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.connectivity.register_sync_trigger(tx.clone());

        if self.connectivity.is_online() && self.pending_count() > 0 {
            let _ = tx.send(SyncTrigger::ConnectivityRestored);
        }
        *self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.drain(trigger).await {
                    Ok(outcome) => debug!(?trigger, ?outcome, "Drain request handled"),
                    Err(e) => error!(?trigger, error = %e, "Drain failed"),
                }
            }
            debug!("Drain loop stopped");
        })
    }
}
