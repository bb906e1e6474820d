//! # beacon-store
//!
//! Channel record persistence for the Beacon push server.
//!
//! The store fronts a remote key-value service through a bounded
//! connection pool and exposes the channel-record contract shared by the
//! session and endpoint layers:
//!
//! - **Record** - channel state machine (`REGISTERED` / `LIVE` /
//!   `DELETED`) with per-state TTLs, plus the per-device channel set
//! - **Kv** - the connection trait, a memcached text-protocol client, and
//!   an in-memory backend for tests and single-node development
//! - **Pool** - coordinator-owned FIFO of reusable connections with
//!   saturation and fatal-error policies
//! - **Store** - the operations themselves (`register`, `update`,
//!   `fetch_all`, ...)

pub mod error;
pub mod kv;
pub mod pool;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use kv::{Connector, KvConnection, KvError, KvSettings};
pub use pool::{ConnectionPool, PoolConfig};
pub use record::{ChannelRecord, ChannelState, DeviceSet};
pub use store::{Store, StoreConfig};
