//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: transport-level address of one connection
//! - `SenderId`: application-level identity supplied at connect time
//! - `InstanceId`: UUID-based identifier of one server instance

use uuid::Uuid;

/// Prefix of every room topic on the relay
pub const ROOM_TOPIC_PREFIX: &str = "room:";

/// Connection identifier (newtype pattern)
///
/// Wraps the peer address string. Assumed unique per live connection;
/// collisions are not deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a client ID from a transport address
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sender identity supplied by the client (`?sender_id=...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId(pub String);

impl SenderId {
    /// Parse a sender identity, rejecting empty or blank values
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique server instance identifier
///
/// Only used to tell instances apart in logs when several share one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Create a new random instance ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay topic for a room name
pub fn room_topic(room_name: &str) -> String {
    format!("{}{}", ROOM_TOPIC_PREFIX, room_name)
}
