//! In-process relay hub
//!
//! One `broadcast` channel per topic. Every instance created in this process
//! with a clone of the same `Arc<LocalRelay>` sees every other instance's
//! publishes, which is all a relay has to provide.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::relay::{Relay, RelayStream};

/// Default number of undelivered payloads buffered per topic
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// In-process [`Relay`] backed by one broadcast channel per topic
#[derive(Debug)]
pub struct LocalRelay {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of open streams on a topic
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// End every open stream, as if the transport connection dropped
    pub async fn disconnect_all(&self) {
        let dropped = {
            let mut topics = self.topics.lock().await;
            std::mem::take(&mut *topics)
        };
        warn!("Local relay dropped {} topic(s)", dropped.len());
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        let topics = self.topics.lock().await;
        let Some(tx) = topics.get(topic) else {
            debug!("No subscribers on {}, payload discarded", topic);
            return Ok(());
        };
        // Err only means every receiver is gone; same as nobody listening
        let receivers = tx.send(payload.to_string()).unwrap_or(0);
        debug!("Published to {} ({} receiver(s))", topic, receivers);
        Ok(())
    }

    async fn open(&self, topic: &str) -> Result<RelayStream, RelayError> {
        let rx = {
            let mut topics = self.topics.lock().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let topic = topic.to_string();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, {} payload(s) lost", topic, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
