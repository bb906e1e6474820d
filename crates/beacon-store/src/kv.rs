//! Key-value backend connections.
//!
//! The store talks to its backing service through the [`KvConnection`]
//! trait so the pool and the record layer stay backend-agnostic. Two
//! implementations ship here: a memcached text-protocol client for
//! production, and an in-memory backend for tests and single-node
//! development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Backend errors.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key does not exist. Normalised to "absent" by the store.
    #[error("key not found")]
    Missing,

    /// An operation exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The service reported an error.
    #[error("server error: {0}")]
    Server(String),

    /// The response could not be parsed.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KvError {
    /// The store adapter's only discriminator between absence and failure.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, KvError::Missing)
    }
}

/// Timeout and retry envelope applied to every connection.
#[derive(Debug, Clone)]
pub struct KvSettings {
    /// Socket send deadline.
    pub send_timeout: Duration,
    /// Socket receive deadline.
    pub recv_timeout: Duration,
    /// Connection-establishment deadline.
    pub poll_timeout: Duration,
    /// Backoff before retrying a failed connection attempt.
    pub retry_timeout: Duration,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(5),
            retry_timeout: Duration::from_secs(5),
        }
    }
}

/// A single connection to the backing service.
#[async_trait]
pub trait KvConnection: Send {
    /// Fetch a value. Returns [`KvError::Missing`] for absent keys.
    async fn get(&mut self, key: &str) -> Result<Vec<u8>, KvError>;

    /// Store a value. A zero `ttl` means no expiry.
    async fn set(&mut self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError>;

    /// Delete a key. Returns [`KvError::Missing`] for absent keys.
    async fn delete(&mut self, key: &str) -> Result<(), KvError>;
}

/// Opens connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh connection.
    async fn connect(&self) -> Result<Box<dyn KvConnection>, KvError>;
}

/// Connector for memcached-compatible services.
///
/// Hosts are assigned to connections round-robin; sharding by key is left
/// to the deployment (one pool per shard).
pub struct MemcacheConnector {
    hosts: Vec<String>,
    settings: KvSettings,
    next_host: AtomicUsize,
}

impl MemcacheConnector {
    /// Create a connector for the given `host:port` endpoints.
    #[must_use]
    pub fn new(hosts: Vec<String>, settings: KvSettings) -> Self {
        Self {
            hosts,
            settings,
            next_host: AtomicUsize::new(0),
        }
    }

    async fn dial(&self, host: &str) -> Result<TcpStream, KvError> {
        match timeout(self.settings.poll_timeout, TcpStream::connect(host)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(KvError::Io(err)),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

#[async_trait]
impl Connector for MemcacheConnector {
    async fn connect(&self) -> Result<Box<dyn KvConnection>, KvError> {
        if self.hosts.is_empty() {
            return Err(KvError::Server("no backend hosts configured".into()));
        }
        let index = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let host = &self.hosts[index];
        let stream = match self.dial(host).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(host = %host, error = %err, "connect failed, retrying after backoff");
                tokio::time::sleep(self.settings.retry_timeout).await;
                self.dial(host).await?
            }
        };
        stream.set_nodelay(true)?;
        debug!(host = %host, "opened backend connection");
        Ok(Box::new(MemcacheConnection::new(
            stream,
            self.settings.clone(),
        )))
    }
}

/// A memcached text-protocol connection.
pub struct MemcacheConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    settings: KvSettings,
}

impl MemcacheConnection {
    fn new(stream: TcpStream, settings: KvSettings) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            settings,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), KvError> {
        match timeout(self.settings.send_timeout, self.writer.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(KvError::Io(err)),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn read_line(&mut self) -> Result<String, KvError> {
        let mut line = String::new();
        let read = timeout(self.settings.recv_timeout, self.reader.read_line(&mut line));
        match read.await {
            Ok(Ok(0)) => Err(KvError::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(err)) => Err(KvError::Io(err)),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), KvError> {
        match timeout(self.settings.recv_timeout, self.reader.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(KvError::Io(err)),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

#[async_trait]
impl KvConnection for MemcacheConnection {
    async fn get(&mut self, key: &str) -> Result<Vec<u8>, KvError> {
        self.send(format!("get {key}\r\n").as_bytes()).await?;
        let header = self.read_line().await?;
        if header == "END" {
            return Err(KvError::Missing);
        }
        let size: usize = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.split_whitespace().nth(2))
            .and_then(|len| len.parse().ok())
            .ok_or_else(|| KvError::Protocol(header.clone()))?;
        let mut data = vec![0u8; size + 2];
        self.read_exact(&mut data).await?;
        data.truncate(size);
        let tail = self.read_line().await?;
        if tail != "END" {
            return Err(KvError::Protocol(tail));
        }
        Ok(data)
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let header = format!("set {key} 0 {} {}\r\n", ttl.as_secs(), value.len());
        let mut frame = Vec::with_capacity(header.len() + value.len() + 2);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(value);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await?;
        match self.read_line().await?.as_str() {
            "STORED" => Ok(()),
            other => Err(KvError::Server(other.to_string())),
        }
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.send(format!("delete {key}\r\n").as_bytes()).await?;
        match self.read_line().await?.as_str() {
            "DELETED" => Ok(()),
            "NOT_FOUND" => Err(KvError::Missing),
            other => Err(KvError::Server(other.to_string())),
        }
    }
}

/// In-memory backend for tests and single-node development.
pub mod memory {
    use super::{
        async_trait, Arc, AtomicUsize, Connector, Duration, HashMap, Instant, KvConnection,
        KvError, Mutex, Ordering, PoisonError,
    };

    #[derive(Clone)]
    struct Entry {
        value: Vec<u8>,
        expires_at: Option<Instant>,
    }

    type Table = Arc<Mutex<HashMap<String, Entry>>>;

    /// Connector handing out connections over one shared table.
    #[derive(Clone, Default)]
    pub struct MemoryConnector {
        table: Table,
        delay: Option<Duration>,
        connects: Arc<AtomicUsize>,
    }

    impl MemoryConnector {
        /// Create an empty backend.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a backend whose operations sleep for `delay` first,
        /// simulating a slow or unresponsive service.
        #[must_use]
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        /// Number of connections opened so far.
        #[must_use]
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn KvConnection>, KvError> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MemoryConnection {
                table: self.table.clone(),
                delay: self.delay,
            }))
        }
    }

    struct MemoryConnection {
        table: Table,
        delay: Option<Duration>,
    }

    impl MemoryConnection {
        async fn simulate_latency(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
            self.table.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl KvConnection for MemoryConnection {
        async fn get(&mut self, key: &str) -> Result<Vec<u8>, KvError> {
            self.simulate_latency().await;
            let mut table = self.lock();
            match table.get(key) {
                Some(entry) if entry.expires_at.is_some_and(|at| at <= Instant::now()) => {
                    table.remove(key);
                    Err(KvError::Missing)
                }
                Some(entry) => Ok(entry.value.clone()),
                None => Err(KvError::Missing),
            }
        }

        async fn set(&mut self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
            self.simulate_latency().await;
            let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
            self.lock().insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at,
                },
            );
            Ok(())
        }

        async fn delete(&mut self, key: &str) -> Result<(), KvError> {
            self.simulate_latency().await;
            match self.lock().remove(key) {
                Some(_) => Ok(()),
                None => Err(KvError::Missing),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryConnector;
    use super::*;

    #[tokio::test]
    async fn test_memory_get_set_delete() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();

        assert!(conn.get("k").await.unwrap_err().is_missing());
        conn.set("k", b"v", Duration::ZERO).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), b"v");
        conn.delete("k").await.unwrap();
        assert!(conn.delete("k").await.unwrap_err().is_missing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ttl_expiry() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();

        conn.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), b"v");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(conn.get("k").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_memory_connections_share_table() {
        let connector = MemoryConnector::new();
        let mut a = connector.connect().await.unwrap();
        let mut b = connector.connect().await.unwrap();

        a.set("k", b"v", Duration::ZERO).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), b"v");
        assert_eq!(connector.connect_count(), 2);
    }

    // Exercises the text-protocol client against a scripted server.
    #[tokio::test]
    async fn test_memcache_protocol_roundtrip() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];

            // set
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("set k 0 0 5\r\n"));
            assert!(req.ends_with("hello\r\n"));
            sock.write_all(b"STORED\r\n").await.unwrap();

            // get hit
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"get k\r\n");
            sock.write_all(b"VALUE k 0 5\r\nhello\r\nEND\r\n")
                .await
                .unwrap();

            // get miss
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"get gone\r\n");
            sock.write_all(b"END\r\n").await.unwrap();

            // delete miss
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"delete gone\r\n");
            sock.write_all(b"NOT_FOUND\r\n").await.unwrap();
        });

        let connector = MemcacheConnector::new(vec![addr.to_string()], KvSettings::default());
        let mut conn = connector.connect().await.unwrap();

        conn.set("k", b"hello", Duration::ZERO).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), b"hello");
        assert!(conn.get("gone").await.unwrap_err().is_missing());
        assert!(conn.delete("gone").await.unwrap_err().is_missing());

        server.await.unwrap();
    }
}
