//! Device and channel identifiers.
//!
//! Both identifiers are opaque 128-bit values. They are rendered as
//! lowercase hex on the wire and in logs, and as raw bytes inside store
//! keys. Device IDs are issued by the server (UUID v4) when a client does
//! not present one; channel IDs are chosen by the client and are unique
//! only within a device.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 16;

/// Length of a binary primary key.
pub const KEY_LEN: usize = 32;

/// Identifier parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier exceeds 16 bytes.
    #[error("identifier is longer than {MAX_ID_LEN} bytes")]
    TooLong,

    /// The identifier is not valid hex.
    #[error("identifier is not valid hex")]
    BadHex,
}

fn parse_id_bytes(s: &str) -> Result<Vec<u8>, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    let bytes = hex::decode(s).map_err(|_| IdError::BadHex)?;
    if bytes.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    Ok(bytes)
}

/// A device identifier (UAID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DeviceId(Vec<u8>);

impl DeviceId {
    /// Generate a fresh random device ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes().to_vec())
    }

    /// Get the raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for DeviceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        parse_id_bytes(s).map(Self)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, IdError> {
        s.parse()
    }
}

/// A channel identifier (CHID), unique within one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChannelId(Vec<u8>);

impl ChannelId {
    /// Construct a channel ID from raw bytes, as stored in a device set.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is empty or longer than 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.is_empty() {
            return Err(IdError::Empty);
        }
        if bytes.len() > MAX_ID_LEN {
            return Err(IdError::TooLong);
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Get the raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for ChannelId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        parse_id_bytes(s).map(Self)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for ChannelId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, IdError> {
        s.parse()
    }
}

/// Compose a 32-byte binary primary key from a device and channel ID.
///
/// Each identifier occupies a right-aligned 16-byte half; shorter values
/// are zero-prefixed. The composition is injective for identifiers of at
/// most 16 bytes.
#[must_use]
pub fn binary_key(uaid: &[u8], chid: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let aoff = MAX_ID_LEN.saturating_sub(uaid.len());
    let boff = KEY_LEN - chid.len().min(MAX_ID_LEN);
    key[aoff..MAX_ID_LEN].copy_from_slice(&uaid[..MAX_ID_LEN.min(uaid.len())]);
    key[boff..].copy_from_slice(&chid[..MAX_ID_LEN.min(chid.len())]);
    key
}

/// Generate a user-readable primary key from hex device and channel IDs.
///
/// The result is embedded in push endpoint URIs. Returns `None` if either
/// half is empty.
#[must_use]
pub fn ids_to_key(suaid: &str, schid: &str) -> Option<String> {
    if suaid.is_empty() || schid.is_empty() {
        return None;
    }
    Some(format!("{suaid}.{schid}"))
}

/// Extract the hex device and channel IDs from a user-readable primary key.
///
/// Splits on the first `.`; both halves must be non-empty.
#[must_use]
pub fn key_to_ids(key: &str) -> Option<(&str, &str)> {
    let (suaid, schid) = key.split_once('.')?;
    if suaid.is_empty() || schid.is_empty() {
        return None;
    }
    Some((suaid, schid))
}
