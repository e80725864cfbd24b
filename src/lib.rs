//! Multi-instance WebSocket Chat Relay Library
//!
//! Clients connect over WebSocket, join named rooms, and exchange text with
//! everyone in the same room, whichever server instance they are connected
//! to.
//!
//! # Architecture
//! - `handler`: one pump per connection; decodes frames, enforces liveness,
//!   dispatches join / leave / message
//! - `RoomManager`: per-instance room registry; one relay subscription per
//!   room with local members, local fanout on every relay delivery
//! - `relay`: opaque publish/subscribe transport plus the reconnecting
//!   subscription adapter
//!
//! A chat message is never written to local members directly: it is
//! published on the room's relay topic and every instance (this one
//! included) delivers it from its subscription.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{Instance, LocalRelay, LogMessageStore, PumpConfig, BackoffConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = Arc::new(LocalRelay::default());
//!     for addr in ["127.0.0.1:8080", "127.0.0.1:8081"] {
//!         let listener = TcpListener::bind(addr).await.unwrap();
//!         let instance = Instance::new(
//!             relay.clone(),
//!             Arc::new(LogMessageStore),
//!             PumpConfig::default(),
//!             BackoffConfig::default(),
//!         );
//!         tokio::spawn(instance.serve(listener));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod message;
pub mod relay;
pub mod room;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types for convenience
pub use client::{Client, FrameWriter, OutboundConfig, WsFrameWriter};
pub use config::Config;
pub use error::{AppError, RelayError, StoreError, WriteError};
pub use handler::{handle_connection, run_pump, ConnectionContext, PumpConfig, ReadExit};
pub use manager::{FanoutReport, RoomManager};
pub use message::{Action, ChatMessage, RelayPayload};
pub use relay::{BackoffConfig, LocalRelay, PubSub, Relay, SubscriptionState};
pub use room::Room;
pub use server::Instance;
pub use store::{LogMessageStore, MessageStore};
pub use types::{ClientId, InstanceId, SenderId};
