//! Message protocol definitions
//!
//! Inbound frames are JSON objects decoded with Serde. Cross-instance
//! delivery uses a plain `<room>|<content>` string framing on the relay.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::ClientId;

/// Delimiter between room name and content in relay payloads
pub const PAYLOAD_DELIMITER: char = '|';

/// Client → Server message
///
/// Unknown fields are ignored. A missing `room_id` is a decode error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub room_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Raw action tag, see [`Action::parse`]
    #[serde(default)]
    pub action: String,
}

impl ChatMessage {
    /// Decode one text frame
    pub fn decode(text: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn action(&self) -> Action {
        Action::parse(&self.action)
    }
}

/// What an inbound message asks the server to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Join,
    Leave,
    Message,
    Unknown,
}

impl Action {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "join" => Action::Join,
            "leave" => Action::Leave,
            "message" => Action::Message,
            _ => Action::Unknown,
        }
    }
}

/// A room-scoped payload as carried by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPayload {
    pub room: String,
    pub content: String,
}

impl RelayPayload {
    pub fn new(room: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            content: content.into(),
        }
    }

    /// Encode as `<room>|<content>`
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.room, PAYLOAD_DELIMITER, self.content)
    }

    /// Split a raw payload on the first delimiter
    ///
    /// Returns None when there is no delimiter. The content may itself
    /// contain the delimiter.
    pub fn decode(raw: &str) -> Option<Self> {
        let (room, content) = raw.split_once(PAYLOAD_DELIMITER)?;
        Some(Self::new(room, content))
    }
}

/// Presence text published when a client joins a room
pub fn joined_notice(client_id: &ClientId) -> String {
    format!("{} joined the room", client_id)
}

/// Presence text published when a client leaves a room
pub fn left_notice(client_id: &ClientId) -> String {
    format!("{} left the room", client_id)
}
