//! Client-facing WebSocket messages.
//!
//! All frames are JSON text. Requests and replies carry a `messageType`
//! discriminator; server replies echo it together with an HTTP-style
//! `status`. The one exception is the client keepalive ping, whose body is
//! the literal string `"{}"` and whose reply is `"{}"` verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The literal ping frame and its reply.
pub const RAW_PING: &str = "{}";

/// Message parsing errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The frame is not valid JSON or has no recognizable `messageType`.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single channel update delivered in a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Hex channel ID.
    #[serde(rename = "channelID")]
    pub channel_id: String,

    /// Channel version.
    pub version: u64,

    /// Optional opaque payload attached by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Update {
    /// Create an update without payload data.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, version: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            version,
            data: None,
        }
    }
}

/// A frame received from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Session handshake. Must be the first frame on a socket.
    Hello {
        /// Previously issued device ID, if the client has one.
        #[serde(default)]
        uaid: Option<String>,

        /// Channel IDs the client believes it is subscribed to.
        #[serde(default, rename = "channelIDs")]
        channel_ids: Vec<String>,

        /// Opaque proprietary-ping registration blob.
        #[serde(default)]
        connect: Option<serde_json::Value>,
    },

    /// Subscribe a new channel and request an endpoint URL.
    Register {
        #[serde(rename = "channelID")]
        channel_id: String,
    },

    /// Drop a channel subscription.
    Unregister {
        #[serde(rename = "channelID")]
        channel_id: String,
    },

    /// Keepalive. Normally sent as the bare `"{}"` frame.
    Ping,

    /// Acknowledge delivered updates.
    Ack { updates: Vec<Update> },

    /// Drop every subscription for this device.
    Purge,
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// The bare `"{}"` keepalive is accepted alongside tagged messages.
    ///
    /// # Errors
    ///
    /// Returns an error for anything that is not a known frame.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        if text.trim() == RAW_PING {
            return Ok(ClientMessage::Ping);
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake reply carrying the (possibly freshly issued) device ID.
    Hello { status: u16, uaid: String },

    /// Registration reply with the push endpoint for the channel.
    Register {
        status: u16,
        #[serde(rename = "channelID")]
        channel_id: String,
        #[serde(rename = "pushEndpoint", skip_serializing_if = "Option::is_none")]
        push_endpoint: Option<String>,
    },

    /// Deregistration reply.
    Unregister {
        status: u16,
        #[serde(rename = "channelID")]
        channel_id: String,
    },

    /// Pending updates and expired channels flushed to the client.
    Notification {
        updates: Vec<Update>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        expired: Vec<String>,
    },

    /// Purge reply.
    Purge { status: u16 },
}

impl ServerMessage {
    /// Encode to a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
