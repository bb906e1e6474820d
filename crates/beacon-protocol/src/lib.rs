//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon push server.
//!
//! This crate defines everything that crosses a process boundary:
//!
//! - **Identifiers** - 128-bit device and channel IDs, and the 32-byte
//!   primary key used to address channel records in the backing store
//! - **Tokens** - the opaque endpoint token handed to third-party senders,
//!   optionally sealed with AES-256-GCM
//! - **Messages** - the JSON frames exchanged with clients over WebSocket
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{ids, ChannelId, DeviceId};
//!
//! let uaid = DeviceId::generate();
//! let chid: ChannelId = "deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap();
//!
//! // The textual key embedded in endpoint URLs.
//! let key = ids::ids_to_key(&uaid.to_string(), &chid.to_string()).unwrap();
//! let (suaid, schid) = ids::key_to_ids(&key).unwrap();
//! assert_eq!(suaid, uaid.to_string());
//! assert_eq!(schid, chid.to_string());
//! ```

pub mod ids;
pub mod messages;
pub mod token;

pub use ids::{ChannelId, DeviceId, IdError};
pub use messages::{ClientMessage, MessageError, ServerMessage, Update, RAW_PING};
pub use token::{TokenCodec, TokenError};
