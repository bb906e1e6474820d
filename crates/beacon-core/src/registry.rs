//! Process-wide device → session worker table.
//!
//! Handlers reach connected clients only through this registry. The table
//! is guarded by a single reader/writer lock and the worker count by an
//! atomic updated inside the same critical section; removal is
//! replace-if-same so a displaced worker cannot evict its successor.

use beacon_protocol::messages::Update;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Control events delivered to a session worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Deliver one update to the client.
    Flush(Update),
    /// Shut the session down.
    Close,
}

/// A handle to one session worker's event queue.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
    /// Wrap a worker's event queue in a handle with a fresh identity.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            events,
        }
    }

    /// The handle's unique identity, used for replace-if-same removal.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue an update flush. Returns `false` if the worker is gone.
    pub fn flush(&self, update: Update) -> bool {
        self.events.send(WorkerEvent::Flush(update)).is_ok()
    }

    /// Ask the worker to close. Returns `false` if it is already gone.
    pub fn close(&self) -> bool {
        self.events.send(WorkerEvent::Close).is_ok()
    }
}

/// The UAID → worker table.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerHandle>>,
    count: AtomicUsize,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the worker currently holding a device's socket.
    #[must_use]
    pub fn get(&self, uaid: &str) -> Option<WorkerHandle> {
        self.read().get(uaid).cloned()
    }

    /// Whether a worker is installed for the device.
    #[must_use]
    pub fn contains(&self, uaid: &str) -> bool {
        self.read().contains_key(uaid)
    }

    /// Install a worker, returning the one it displaced (if any) so the
    /// caller can close it.
    pub fn insert(&self, uaid: &str, handle: WorkerHandle) -> Option<WorkerHandle> {
        let mut workers = self.write();
        let displaced = workers.insert(uaid.to_string(), handle);
        if displaced.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        debug!(uaid, displaced = displaced.is_some(), "worker installed");
        displaced
    }

    /// Remove the worker for a device, but only if it is still the one
    /// identified by `worker_id`.
    pub fn remove(&self, uaid: &str, worker_id: u64) -> bool {
        let mut workers = self.write();
        match workers.get(uaid) {
            Some(current) if current.id() == worker_id => {
                workers.remove(uaid);
                self.count.fetch_sub(1, Ordering::Relaxed);
                debug!(uaid, "worker removed");
                true
            }
            _ => false,
        }
    }

    /// Number of installed workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether no workers are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every worker and return the handles, for shutdown.
    pub fn drain(&self) -> Vec<WorkerHandle> {
        let mut workers = self.write();
        let handles: Vec<WorkerHandle> = workers.drain().map(|(_, handle)| handle).collect();
        self.count.store(0, Ordering::Relaxed);
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerHandle::new(tx), rx)
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = WorkerRegistry::new();
        let (worker, _rx) = handle();
        let id = worker.id();

        assert!(registry.insert("aa", worker).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("aa"));
        assert!(registry.get("aa").is_some());

        assert!(registry.remove("aa", id));
        assert!(registry.is_empty());
        assert!(registry.get("aa").is_none());
    }

    #[test]
    fn test_insert_displaces_previous_worker() {
        let registry = WorkerRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let second_id = second.id();

        registry.insert("aa", first.clone());
        let displaced = registry.insert("aa", second).unwrap();
        assert_eq!(displaced.id(), first.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("aa").unwrap().id(), second_id);
    }

    #[test]
    fn test_remove_is_replace_if_same() {
        let registry = WorkerRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let first_id = first.id();
        let second_id = second.id();

        registry.insert("aa", first);
        registry.insert("aa", second);

        // A displaced worker's late removal must not evict its successor.
        assert!(!registry.remove("aa", first_id));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("aa", second_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_flush_reaches_worker_queue() {
        let registry = WorkerRegistry::new();
        let (worker, mut rx) = handle();
        registry.insert("aa", worker);

        let handle = registry.get("aa").unwrap();
        assert!(handle.flush(Update::new("bb", 42)));
        match rx.try_recv().unwrap() {
            WorkerEvent::Flush(update) => {
                assert_eq!(update.channel_id, "bb");
                assert_eq!(update.version, 42);
            }
            WorkerEvent::Close => panic!("expected flush"),
        }
    }

    #[test]
    fn test_flush_after_worker_dropped() {
        let (worker, rx) = handle();
        drop(rx);
        assert!(!worker.flush(Update::new("bb", 1)));
        assert!(!worker.close());
    }

    #[test]
    fn test_drain() {
        let registry = WorkerRegistry::new();
        let (a, _rx1) = handle();
        let (b, _rx2) = handle();
        registry.insert("aa", a);
        registry.insert("bb", b);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
