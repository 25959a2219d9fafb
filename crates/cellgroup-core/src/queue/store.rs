use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::operation::{Operation, OperationStatus, QueuedOperation};
use crate::storage::{KeyValueStore, StorageResult};

/// Storage key for the serialized queue.
pub const QUEUE_KEY: &str = "sync.queue";

/// Storage key for the timestamp of the last completed sync.
pub const LAST_SYNC_KEY: &str = "sync.last_sync";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_id: u64,
    entries: Vec<QueuedOperation>,
}

/// FIFO store of queued operations.
///
/// Entries keep creation order for their whole life. Ids are handed out from
/// a persisted counter so they never repeat across restarts.
pub struct OperationQueue {
    store: Arc<dyn KeyValueStore>,
    state: QueueState,
    last_sync: Option<DateTime<Utc>>,
}

impl OperationQueue {
    /// Load the queue from storage, creating an empty one if none exists.
    ///
    /// Entries left `in_flight` by an interrupted process go back to
    /// `pending`: the remote call never confirmed, so the operation has to
    /// run again.
    pub fn open(store: Arc<dyn KeyValueStore>) -> StorageResult<Self> {
        let mut state: QueueState = match store.get(QUEUE_KEY)? {
            Some(json) => serde_json::from_str(&json)?,
            None => QueueState::default(),
        };

        let last_sync = match store.get(LAST_SYNC_KEY)? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable last sync timestamp");
                    None
                }
            },
            None => None,
        };

        let max_id = state.entries.iter().map(|e| e.id).max().unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);

        let mut recovered = 0;
        for entry in state.entries.iter_mut() {
            if entry.status == OperationStatus::InFlight {
                entry.status = OperationStatus::Pending;
                recovered += 1;
            }
        }

        let mut queue = Self {
            store,
            state,
            last_sync,
        };

        if recovered > 0 {
            info!(count = recovered, "Recovered interrupted operations");
            let state = queue.state.clone();
            queue.commit(state)?;
        }

        debug!(entries = queue.state.entries.len(), "Operation queue opened");
        Ok(queue)
    }

    fn commit(&mut self, next: QueueState) -> StorageResult<()> {
        let json = serde_json::to_string(&next)?;
        self.store.set(QUEUE_KEY, &json)?;
        self.state = next;
        Ok(())
    }

    /// Apply `f` to a copy of the state and persist it.
    fn update<R>(&mut self, f: impl FnOnce(&mut QueueState) -> R) -> StorageResult<R> {
        let mut next = self.state.clone();
        let result = f(&mut next);
        self.commit(next)?;
        Ok(result)
    }

    /// Update a single entry. Returns `false` without writing when `id` is
    /// not queued.
    fn update_entry(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut QueuedOperation),
    ) -> StorageResult<bool> {
        if !self.state.entries.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        self.update(|state| {
            if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                f(entry);
            }
        })?;
        Ok(true)
    }

    /// Append an operation at the tail. The operation is durable once this
    /// returns `Ok`.
    pub fn enqueue(&mut self, operation: Operation) -> StorageResult<QueuedOperation> {
        let entry = QueuedOperation::new(self.state.next_id, operation);
        let queued = entry.clone();
        self.update(move |state| {
            state.next_id += 1;
            state.entries.push(entry);
        })?;
        debug!(id = queued.id, kind = %queued.kind(), "Operation queued");
        Ok(queued)
    }

    /// Oldest pending entry.
    pub fn peek_next(&self) -> Option<QueuedOperation> {
        self.state.entries.iter().find(|e| e.is_pending()).cloned()
    }

    /// Oldest pending entry created after `id`.
    pub fn peek_next_after(&self, id: u64) -> Option<QueuedOperation> {
        self.state
            .entries
            .iter()
            .find(|e| e.id > id && e.is_pending())
            .cloned()
    }

    pub fn get(&self, id: u64) -> Option<&QueuedOperation> {
        self.state.entries.iter().find(|e| e.id == id)
    }

    /// Mark an entry as executing. This counts as an attempt, so an attempt
    /// cut short by a crash or lost connection is still counted.
    pub fn mark_in_flight(&mut self, id: u64) -> StorageResult<bool> {
        self.update_entry(id, |entry| {
            entry.status = OperationStatus::InFlight;
            entry.attempts += 1;
        })
    }

    /// Put an `in_flight` entry back to `pending` in memory only, after the
    /// write recording its outcome failed. The stored copy still says
    /// `in_flight`, which `open` recovers the same way.
    pub fn release(&mut self, id: u64) -> bool {
        match self
            .state
            .entries
            .iter_mut()
            .find(|e| e.id == id && e.status == OperationStatus::InFlight)
        {
            Some(entry) => {
                entry.status = OperationStatus::Pending;
                true
            }
            None => false,
        }
    }

    /// Remove an entry the remote store has confirmed.
    pub fn mark_done(&mut self, id: u64) -> StorageResult<bool> {
        if self.get(id).is_none() {
            return Ok(false);
        }
        self.update(|state| state.entries.retain(|e| e.id != id))?;
        Ok(true)
    }

    /// Mark an entry as permanently failed. It stays queued for inspection
    /// and is skipped by drains until cleared or requeued.
    pub fn mark_failed(&mut self, id: u64, error: &str) -> StorageResult<bool> {
        self.update_entry(id, |entry| {
            entry.status = OperationStatus::Failed;
            entry.last_error = Some(error.to_string());
        })
    }

    /// Return an entry to `pending` after a transient failure, or to
    /// `failed` once it has used `max_attempts` attempts.
    pub fn mark_retry(
        &mut self,
        id: u64,
        error: &str,
        max_attempts: u32,
    ) -> StorageResult<Option<OperationStatus>> {
        let mut status = None;
        self.update_entry(id, |entry| {
            entry.status = if entry.attempts >= max_attempts {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
            entry.last_error = Some(error.to_string());
            status = Some(entry.status);
        })?;
        Ok(status)
    }

    /// Entries that have not been confirmed or given up on, oldest first.
    pub fn list_pending(&self) -> Vec<QueuedOperation> {
        self.state
            .entries
            .iter()
            .filter(|e| !e.is_failed())
            .cloned()
            .collect()
    }

    pub fn list_failed(&self) -> Vec<QueuedOperation> {
        self.state
            .entries
            .iter()
            .filter(|e| e.is_failed())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.entries.iter().filter(|e| !e.is_failed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.state.entries.iter().filter(|e| e.is_failed()).count()
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// Drop every failed entry. Returns how many were removed.
    pub fn clear_failed(&mut self) -> StorageResult<usize> {
        let count = self.failed_count();
        if count == 0 {
            return Ok(0);
        }
        self.update(|state| state.entries.retain(|e| !e.is_failed()))?;
        info!(count, "Cleared failed operations");
        Ok(count)
    }

    /// Give every failed entry a fresh set of attempts.
    pub fn requeue_failed(&mut self) -> StorageResult<usize> {
        let count = self.failed_count();
        if count == 0 {
            return Ok(0);
        }
        self.update(|state| {
            for entry in state.entries.iter_mut().filter(|e| e.is_failed()) {
                entry.status = OperationStatus::Pending;
                entry.attempts = 0;
            }
        })?;
        info!(count, "Requeued failed operations");
        Ok(count)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn record_sync(&mut self, at: DateTime<Utc>) -> StorageResult<()> {
        let json = serde_json::to_string(&at)?;
        self.store.set(LAST_SYNC_KEY, &json)?;
        self.last_sync = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemberPatch;
    use crate::storage::{FileStore, MemoryStore, StorageError};

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> StorageResult<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn remove(&self, _key: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    fn update(id: &str, phone: &str) -> Operation {
        Operation::UpdateMember {
            id: id.to_string(),
            patch: MemberPatch {
                phone: Some(phone.to_string()),
                ..Default::default()
            },
        }
    }

    fn memory_queue() -> OperationQueue {
        OperationQueue::open(Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids_in_fifo_order() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        let b = queue.enqueue(update("m1", "2")).unwrap();
        let c = queue.enqueue(update("m2", "3")).unwrap();

        assert!(a.id < b.id && b.id < c.id);
        let ids: Vec<u64> = queue.list_pending().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(queue.peek_next().map(|e| e.id), Some(a.id));
        assert_eq!(queue.peek_next_after(a.id).map(|e| e.id), Some(b.id));
        assert_eq!(queue.peek_next_after(c.id), None);
    }

    #[test]
    fn test_peek_skips_in_flight_and_failed() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        let b = queue.enqueue(update("m2", "2")).unwrap();
        let c = queue.enqueue(update("m3", "3")).unwrap();

        queue.mark_in_flight(a.id).unwrap();
        queue.mark_failed(b.id, "rejected").unwrap();

        assert_eq!(queue.peek_next().map(|e| e.id), Some(c.id));
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.failed_count(), 1);
    }

    #[test]
    fn test_mark_done_removes_entry() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        assert!(queue.mark_done(a.id).unwrap());
        assert!(queue.is_empty());
        assert!(!queue.mark_done(a.id).unwrap());
    }

    #[test]
    fn test_attempt_counted_when_marked_in_flight() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();

        queue.mark_in_flight(a.id).unwrap();
        let status = queue.mark_retry(a.id, "timeout", 5).unwrap();

        assert_eq!(status, Some(OperationStatus::Pending));
        let entry = queue.get(a.id).unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_retry_ceiling_marks_failed() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();

        for _ in 0..2 {
            queue.mark_in_flight(a.id).unwrap();
            queue.mark_retry(a.id, "503", 3).unwrap();
        }
        assert!(queue.get(a.id).unwrap().is_pending());

        queue.mark_in_flight(a.id).unwrap();
        let status = queue.mark_retry(a.id, "503", 3).unwrap();
        assert_eq!(status, Some(OperationStatus::Failed));
        assert_eq!(queue.peek_next(), None);
    }

    #[test]
    fn test_clear_failed_keeps_pending() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        let b = queue.enqueue(update("m2", "2")).unwrap();
        queue.mark_failed(a.id, "rejected").unwrap();

        assert_eq!(queue.clear_failed().unwrap(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_next().map(|e| e.id), Some(b.id));
        assert_eq!(queue.clear_failed().unwrap(), 0);
    }

    #[test]
    fn test_requeue_failed_resets_attempts() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        queue.mark_in_flight(a.id).unwrap();
        queue.mark_failed(a.id, "rejected").unwrap();

        assert_eq!(queue.requeue_failed().unwrap(), 1);
        let entry = queue.get(a.id).unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.attempts, 0);
    }

    #[test]
    fn test_interrupted_in_flight_entry_is_pending_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());

        let id = {
            let mut queue = OperationQueue::open(Arc::clone(&store)).unwrap();
            let a = queue.enqueue(update("m1", "1")).unwrap();
            queue.mark_in_flight(a.id).unwrap();
            a.id
            // process "crashes" here: the remote call never completed
        };

        let reopened = OperationQueue::open(Arc::new(FileStore::open(dir.path()).unwrap())).unwrap();
        assert_eq!(reopened.len(), 1);
        let entry = reopened.get(id).unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn test_ids_not_reused_after_reopen() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = {
            let mut queue = OperationQueue::open(Arc::clone(&store)).unwrap();
            let a = queue.enqueue(update("m1", "1")).unwrap();
            queue.mark_done(a.id).unwrap();
            a.id
        };
        let mut queue = OperationQueue::open(store).unwrap();
        let b = queue.enqueue(update("m1", "2")).unwrap();
        assert!(b.id > first);
    }

    #[test]
    fn test_failed_write_leaves_queue_unchanged() {
        let mut queue = OperationQueue::open(Arc::new(FailingStore)).unwrap();
        let result = queue.enqueue(update("m1", "1"));
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(queue.is_empty());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_release_returns_in_flight_entry_to_pending() {
        let mut queue = memory_queue();
        let a = queue.enqueue(update("m1", "1")).unwrap();
        queue.mark_in_flight(a.id).unwrap();
        assert!(queue.peek_next().is_none());

        assert!(queue.release(a.id));

        assert_eq!(queue.peek_next().map(|e| e.id), Some(a.id));
        assert_eq!(queue.get(a.id).unwrap().attempts, 1);
        assert_eq!(queue.pending_count(), 1);
        assert!(!queue.release(a.id));
    }

    #[test]
    fn test_last_sync_persists() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        {
            let mut queue = OperationQueue::open(Arc::clone(&store)).unwrap();
            assert_eq!(queue.last_sync(), None);
            queue.record_sync(now).unwrap();
        }
        let queue = OperationQueue::open(store).unwrap();
        assert_eq!(queue.last_sync(), Some(now));
    }
}
