//! Cross-instance publish/subscribe relay
//!
//! [`Relay`] is the opaque transport: publish a string payload on a topic,
//! or open a stream of every payload published on a topic from now on. A
//! stream that ends means the transport dropped; reconnecting is the job of
//! [`PubSub`], not of the transport or of the room manager.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::RelayError;

pub mod local;
pub mod subscription;

pub use local::LocalRelay;
pub use subscription::{BackoffConfig, PayloadHandler, PubSub, SubscriptionState};

/// Payloads delivered on one topic, in publish order
pub type RelayStream = BoxStream<'static, String>;

/// Opaque publish/subscribe primitive keyed by topic name
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Publish one payload. Fails only on transport/serialization error.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError>;

    /// Open a stream of payloads for a topic
    async fn open(&self, topic: &str) -> Result<RelayStream, RelayError>;
}
