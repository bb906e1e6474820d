//! Bounded connection pool.
//!
//! A single coordinator task owns the FIFO of idle connections; callers
//! interact with it only through channels. Acquisitions drain the idle
//! list, grow the pool up to `max_conns` on demand, and observe
//! saturation as a dropped reply. Any connection-creation failure is
//! fatal: the pool closes and the recorded error is replayed to every
//! subsequent caller.

use crate::error::StoreError;
use crate::kv::{Connector, KvConnection, KvError};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Pool sizing and wait policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened at init.
    pub min_conns: usize,
    /// Hard cap on open connections.
    pub max_conns: usize,
    /// Maximum time to wait for a free connection.
    pub pool_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 100,
            max_conns: 400,
            pool_timeout: Duration::from_secs(5),
        }
    }
}

type Conn = Box<dyn KvConnection>;
type AcquireReply = oneshot::Sender<Lease>;

#[derive(Default)]
struct CloseState {
    is_closing: bool,
    last_err: Option<String>,
}

#[derive(Default)]
struct Shared {
    close: Mutex<CloseState>,
}

impl Shared {
    fn lock_close(&self) -> MutexGuard<'_, CloseState> {
        self.close.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fatal(&self, shutdown: &CancellationToken, err: &KvError) {
        error!(error = %err, "connection create failed, closing pool");
        let mut close = self.lock_close();
        if close.last_err.is_none() {
            close.last_err = Some(err.to_string());
        }
        close.is_closing = true;
        drop(close);
        shutdown.cancel();
    }
}

/// A leased connection; returns itself to the pool on drop.
pub struct Lease {
    conn: Option<Conn>,
    releases: mpsc::UnboundedSender<Conn>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl Lease {
    fn new(conn: Conn, releases: mpsc::UnboundedSender<Conn>) -> Self {
        Self {
            conn: Some(conn),
            releases,
        }
    }
}

impl Deref for Lease {
    type Target = dyn KvConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("lease already released")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("lease already released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // If the coordinator is gone the connection simply closes.
            let _ = self.releases.send(conn);
        }
    }
}

/// The connection pool handle.
pub struct ConnectionPool {
    acquisitions: mpsc::UnboundedSender<AcquireReply>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
    pool_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool and spawn its coordinator.
    ///
    /// The pool seeds itself with `min_conns` connections in the
    /// background; a seed failure closes the pool.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let (acq_tx, acq_rx) = mpsc::unbounded_channel();
        let (rel_tx, rel_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared::default());

        tokio::spawn(run_coordinator(
            connector,
            config.clone(),
            acq_rx,
            rel_rx,
            rel_tx,
            shutdown.clone(),
            shared.clone(),
        ));

        Self {
            acquisitions: acq_tx,
            shutdown,
            shared,
            pool_timeout: config.pool_timeout,
        }
    }

    /// Acquire a connection, waiting at most `pool_timeout`.
    ///
    /// # Errors
    ///
    /// `PoolSaturated` when no connection frees up in time or the pool is
    /// at capacity; `Closed` / `Fatal` once the pool has shut down.
    pub async fn acquire(&self) -> Result<Lease, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.acquisitions.send(reply_tx).is_err() {
            return Err(self.closed_error());
        }
        match tokio::time::timeout(self.pool_timeout, reply_rx).await {
            Ok(Ok(lease)) => Ok(lease),
            // Reply dropped without sending: saturated, or fatal shutdown.
            Ok(Err(_)) => {
                if self.is_closing() {
                    Err(self.closed_error())
                } else {
                    Err(StoreError::PoolSaturated)
                }
            }
            Err(_) => Err(StoreError::PoolSaturated),
        }
    }

    /// Close the pool. Idempotent; in-flight holders release normally.
    pub fn close(&self) {
        {
            let mut close = self.shared.lock_close();
            if close.is_closing {
                return;
            }
            close.is_closing = true;
        }
        self.shutdown.cancel();
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.lock_close().is_closing
    }

    fn closed_error(&self) -> StoreError {
        match &self.shared.lock_close().last_err {
            Some(err) => StoreError::Fatal(err.clone()),
            None => StoreError::Closed,
        }
    }
}

async fn run_coordinator(
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    mut acq_rx: mpsc::UnboundedReceiver<AcquireReply>,
    mut rel_rx: mpsc::UnboundedReceiver<Conn>,
    rel_tx: mpsc::UnboundedSender<Conn>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
) {
    let max_conns = config.max_conns.max(1);
    let min_conns = config.min_conns.min(max_conns);

    let mut idle: VecDeque<Conn> = VecDeque::with_capacity(min_conns);
    let mut capacity = 0usize;

    for _ in 0..min_conns {
        match connector.connect().await {
            Ok(conn) => {
                idle.push_back(conn);
                capacity += 1;
            }
            Err(err) => {
                shared.fatal(&shutdown, &err);
                return;
            }
        }
    }
    debug!(seeded = capacity, "connection pool ready");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            Some(conn) = rel_rx.recv() => {
                if capacity > max_conns {
                    // Capacity shrank below the number of open connections;
                    // close instead of re-queueing.
                    capacity -= 1;
                    drop(conn);
                } else {
                    idle.push_back(conn);
                }
            }

            Some(reply) = acq_rx.recv() => {
                if let Some(conn) = idle.pop_front() {
                    let _ = reply.send(Lease::new(conn, rel_tx.clone()));
                } else if capacity < max_conns {
                    match connector.connect().await {
                        Ok(conn) => {
                            capacity += 1;
                            let _ = reply.send(Lease::new(conn, rel_tx.clone()));
                        }
                        Err(err) => {
                            drop(reply);
                            shared.fatal(&shutdown, &err);
                            break;
                        }
                    }
                }
                // At capacity with nothing idle: drop the reply without
                // sending and the caller observes saturation.
            }
        }
    }

    // Close every connection still idle; leased ones close on release.
    idle.clear();
    debug!("connection pool coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryConnector;
    use async_trait::async_trait;
    use std::time::Instant;

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self) -> Result<Box<dyn KvConnection>, KvError> {
            Err(KvError::Server("backend down".into()))
        }
    }

    fn small_pool(connector: &MemoryConnector, min: usize, max: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(connector.clone()),
            PoolConfig {
                min_conns: min,
                max_conns: max,
                pool_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_pool_reuses_connections() {
        let connector = MemoryConnector::new();
        let pool = small_pool(&connector, 2, 4);

        for _ in 0..5 {
            let lease = pool.acquire().await.unwrap();
            drop(lease);
        }
        // All acquisitions were served by the two seeded connections.
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_grows_on_demand() {
        let connector = MemoryConnector::new();
        let pool = small_pool(&connector, 1, 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count(), 3);
        drop((a, b, c));
    }

    #[tokio::test]
    async fn test_pool_saturation() {
        let connector = MemoryConnector::new();
        let pool = small_pool(&connector, 1, 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::PoolSaturated));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Releasing unblocks the next caller; nothing leaked.
        drop(a);
        let c = pool.acquire().await.unwrap();
        drop((b, c));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_close_is_idempotent() {
        let connector = MemoryConnector::new();
        let pool = small_pool(&connector, 1, 2);

        pool.close();
        pool.close();
        assert!(pool.is_closing());
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            StoreError::Closed | StoreError::PoolSaturated
        ));
    }

    #[tokio::test]
    async fn test_pool_fatal_on_connect_failure() {
        let pool = ConnectionPool::new(
            Arc::new(FailingConnector),
            PoolConfig {
                min_conns: 1,
                max_conns: 2,
                pool_timeout: Duration::from_millis(50),
            },
        );

        let err = pool.acquire().await.unwrap_err();
        assert!(
            matches!(&err, StoreError::Fatal(msg) if msg.contains("backend down"))
                || matches!(err, StoreError::PoolSaturated),
            "unexpected error: {err:?}"
        );

        // The failure is sticky for subsequent acquirers.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.is_closing());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(&err, StoreError::Fatal(msg) if msg.contains("backend down")));
    }
}
