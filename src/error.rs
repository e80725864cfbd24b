//! Error types for the chat relay
//!
//! Defines connection-level errors, per-client write errors, relay errors
//! and persistence errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// frame-local errors (log and drop the offending frame).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection request carried no sender identity
    #[error("sender_id is missing")]
    MissingSenderId,

    /// Inbound message has an empty room identifier
    #[error("room_id is empty")]
    EmptyRoomId,

    /// Room identifier contains the relay payload delimiter
    #[error("room_id contains '|': {0}")]
    InvalidRoomId(String),

    /// Inbound message has an action we do not handle
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Relay publish failed
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Per-client write errors
///
/// Isolated to one client; never aborts a fanout to its siblings.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The underlying WebSocket sink failed
    #[error("WebSocket write failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection has already been closed
    #[error("Connection closed")]
    Closed,

    /// The client's outbound queue is full; the frame was dropped
    #[error("Outbound queue full")]
    Full,
}

/// Relay transport errors
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Transport-level failure (connection dropped, refused, ...)
    #[error("relay transport error: {0}")]
    Transport(String),
}

/// Message persistence errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
