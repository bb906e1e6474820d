//! Store error taxonomy.

use crate::kv::KvError;
use crate::record::CodecError;
use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// All pool connections are in use and none freed up in time.
    #[error("connection pool saturated")]
    PoolSaturated,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// The pool shut down after an unrecoverable error; the original
    /// failure is replayed to every subsequent caller.
    #[error("store failed fatally: {0}")]
    Fatal(String),

    /// The status probe read back a value it did not write.
    #[error("status probe returned a mismatched value")]
    InvalidValue,

    /// The channel is not registered for this device.
    #[error("channel is not registered for this device")]
    InvalidChannel,

    /// A record or device set could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backing service failed.
    #[error("backend error: {0}")]
    Backend(#[from] KvError),
}

impl StoreError {
    /// Whether the error indicates a backend or capacity problem, as
    /// opposed to a caller mistake.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            StoreError::PoolSaturated
                | StoreError::Closed
                | StoreError::Fatal(_)
                | StoreError::Backend(_)
        )
    }
}
