//! Signalling wire format.
//!
//! Text WebSocket messages are JSON objects discriminated by a lowercase
//! `type` key; binary messages carry raw 640-byte PCM frames and never
//! appear here. Parsing distinguishes three cases the server treats
//! differently: a well-formed message, a well-formed envelope with an
//! unknown `type` (answered with an error frame), and garbage (dropped
//! silently).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming signalling message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(default)]
        name: String,
    },
    CreateChannel {
        #[serde(default)]
        channel: String,
    },
    Join {
        #[serde(default)]
        channel: String,
    },
    Switch {
        #[serde(default)]
        channel: String,
    },
    Leave,
    CloseChannel {
        #[serde(default)]
        channel: String,
    },
    ListChannels,
    Talking {
        #[serde(default)]
        talking: bool,
    },
    Mute {
        #[serde(default)]
        muted: bool,
    },
    Ping,
}

/// `type` values [`ClientMessage`] can deserialize from.
///
/// Used to tell a malformed payload of a known type (dropped) apart from an
/// unknown type (answered with an error frame).
const KNOWN_TYPES: &[&str] = &[
    "register",
    "create_channel",
    "join",
    "switch",
    "leave",
    "close_channel",
    "list_channels",
    "talking",
    "mute",
    "ping",
];

/// Outcome of parsing one inbound text frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// A well-formed signalling message.
    Message(ClientMessage),
    /// Valid JSON with an unrecognised `type` value.
    UnknownType(String),
    /// Malformed JSON, a missing/non-string `type`, or a bad payload for a
    /// known type. Dropped without a reply.
    Invalid,
}

/// Parses one inbound text frame into an [`Inbound`] classification.
pub fn parse_client_message(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Invalid,
    };
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Inbound::Invalid,
    };
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => Inbound::Message(msg),
        Err(_) if KNOWN_TYPES.contains(&kind.as_str()) => Inbound::Invalid,
        Err(_) => Inbound::UnknownType(kind),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Outgoing signalling message or notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        name: String,
        channels: Vec<ChannelInfo>,
    },
    Joined {
        channel: String,
        owner: String,
        users: Vec<String>,
    },
    Left,
    Muted {
        muted: bool,
        /// Present (`"admin"`) when the flag was forced from the admin surface.
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Pong,
    Channels {
        list: Vec<ChannelInfo>,
    },
    UserJoined {
        name: String,
    },
    UserLeft {
        name: String,
        channel: String,
    },
    ChannelCreated {
        channel: String,
        owner: String,
    },
    ChannelDeleted {
        channel: String,
    },
    ChannelClosed {
        channel: String,
    },
    Talking {
        name: String,
        talking: bool,
    },
    Kicked {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Builds an `error{message}` frame from any displayable error.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// One channel as reported in `channels` lists and admin status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub owner: String,
    pub user_count: usize,
    pub users: Vec<String>,
}

/// One session as reported in admin status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub name: Option<String>,
    pub channel: Option<String>,
    pub muted: bool,
    pub talking: bool,
    pub queue_size: usize,
}

/// Full relay snapshot for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Seconds since the relay started.
    pub uptime: u64,
    pub clients: Vec<ClientStatus>,
    pub channels: Vec<ChannelInfo>,
}
