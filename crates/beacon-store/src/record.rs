//! Channel records and device sets.
//!
//! Records are serialized with MessagePack in field-name-elided (array)
//! mode to keep stored blobs small: a record is `[state, version,
//! last_touched]` and a device set is an array of binary channel IDs.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

/// Codec errors for stored blobs.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Decoding failed.
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Channel record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
#[repr(i8)]
pub enum ChannelState {
    /// Marked deleted; pruned after the deleted TTL.
    Deleted = 0,
    /// Has a version and is deliverable.
    Live = 1,
    /// Registered but no notification received yet.
    Registered = 2,
}

impl From<ChannelState> for i8 {
    fn from(state: ChannelState) -> i8 {
        state as i8
    }
}

impl TryFrom<i8> for ChannelState {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelState::Deleted),
            1 => Ok(ChannelState::Live),
            2 => Ok(ChannelState::Registered),
            other => Err(format!("unknown channel state {other}")),
        }
    }
}

/// A stored channel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Current state.
    pub state: ChannelState,
    /// Channel version; greater than zero for `Live` records.
    pub version: u64,
    /// Unix seconds of the last write. Never mutated by reads.
    pub last_touched: i64,
}

impl ChannelRecord {
    /// Create a record; the store stamps `last_touched` on write.
    #[must_use]
    pub fn new(state: ChannelState, version: u64) -> Self {
        Self {
            state,
            version,
            last_touched: 0,
        }
    }

    /// Encode to the stored blob format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode from the stored blob format.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is not a valid record.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(raw)?)
    }
}

/// The set of channel IDs registered for one device.
///
/// Kept sorted lexicographically; duplicates are pared out on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet(Vec<Vec<u8>>);

impl DeviceSet {
    /// Build a set from raw channel IDs, sorting and de-duplicating.
    #[must_use]
    pub fn from_channels<'a>(channels: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut inner: Vec<Vec<u8>> = channels.into_iter().map(<[u8]>::to_vec).collect();
        inner.sort();
        inner.dedup();
        Self(inner)
    }

    /// Decode from the stored blob format.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is not an array of byte strings.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        let list: Vec<ByteBuf> = rmp_serde::from_slice(raw)?;
        let mut inner: Vec<Vec<u8>> = list.into_iter().map(ByteBuf::into_vec).collect();
        inner.sort();
        inner.dedup();
        Ok(Self(inner))
    }

    /// Encode to the stored blob format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let list: Vec<ByteBuf> = self.0.iter().map(|c| ByteBuf::from(c.clone())).collect();
        Ok(rmp_serde::to_vec(&list)?)
    }

    /// Whether the set contains the channel.
    #[must_use]
    pub fn contains(&self, chid: &[u8]) -> bool {
        self.0.binary_search_by(|e| e.as_slice().cmp(chid)).is_ok()
    }

    /// Insert a channel, keeping the set sorted.
    ///
    /// Returns `false` if it was already present.
    pub fn insert(&mut self, chid: &[u8]) -> bool {
        match self.0.binary_search_by(|e| e.as_slice().cmp(chid)) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, chid.to_vec());
                true
            }
        }
    }

    /// Remove a channel.
    ///
    /// Returns `false` if it was not present.
    pub fn remove(&mut self, chid: &[u8]) -> bool {
        match self.0.binary_search_by(|e| e.as_slice().cmp(chid)) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Iterate the channel IDs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().map(Vec::as_slice)
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
