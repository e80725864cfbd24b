//! Message persistence seam
//!
//! Chat messages are saved before they are broadcast. Durable storage is
//! out of scope for the relay; [`LogMessageStore`] only records the save
//! in the log so deployments without a database still run.

use async_trait::async_trait;
use tracing::info;

use crate::error::StoreError;

/// Persists chat messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, room_id: &str, content: &str) -> Result<(), StoreError>;
}

/// [`MessageStore`] that writes each message to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageStore;

#[async_trait]
impl MessageStore for LogMessageStore {
    async fn save_message(&self, room_id: &str, content: &str) -> Result<(), StoreError> {
        info!("Saving message for room={}: {}", room_id, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_store_accepts_messages() {
        assert!(LogMessageStore.save_message("r1", "hi").await.is_ok());
    }
}
