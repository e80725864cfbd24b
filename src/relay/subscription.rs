//! Durable topic subscriptions over a [`Relay`]
//!
//! Each subscribed topic gets one task that runs a small state machine:
//!
//! ```text
//! Connecting ──open ok──▶ Subscribed ──stream ended──▶ Reconnecting{n}
//!     ▲   │                                               │
//!     │   └──open failed────────────────────────────────▶─┤
//!     └───────────────────── backoff elapsed ─────────────┘
//! ```
//!
//! Any state moves to `Closed` once the topic is unsubscribed. Transport
//! failures never reach the caller of [`PubSub::subscribe`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn, Instrument};

use crate::error::RelayError;
use crate::relay::{Relay, RelayStream};

/// Callback invoked for every payload delivered on a topic
pub type PayloadHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observable state of one topic subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Opening a stream on the relay
    Connecting,
    /// Stream open, payloads flow to the handler
    Subscribed,
    /// Waiting out the backoff before attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Unsubscribed; the task has exited
    Closed,
}

/// Capped exponential backoff for relay reconnects
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on the delay between retries
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with up to 10% random jitter added
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// One running topic subscription
struct ActiveSubscription {
    /// Dropping this stops the task
    _shutdown: oneshot::Sender<()>,
    state: watch::Receiver<SubscriptionState>,
}

/// Subscription adapter: publish, subscribe and unsubscribe by topic
///
/// Holds at most one subscription task per topic.
pub struct PubSub {
    relay: Arc<dyn Relay>,
    backoff: BackoffConfig,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
}

impl PubSub {
    pub fn new(relay: Arc<dyn Relay>, backoff: BackoffConfig) -> Self {
        Self {
            relay,
            backoff,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a payload on a topic
    ///
    /// Errors are reported, not retried.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        self.relay.publish(topic, payload).await
    }

    /// Start delivering every payload on `topic` to `handler`
    ///
    /// The first stream is opened before this returns, so a payload
    /// published afterwards is delivered whenever the transport is up. If
    /// that open fails the task starts out reconnecting. A previous
    /// subscription on the same topic is replaced.
    pub async fn subscribe(&self, topic: &str, handler: PayloadHandler) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.remove(topic).is_some() {
            warn!("Replacing existing subscription on {}", topic);
        }

        let first = self.relay.open(topic).await;
        let initial_state = if first.is_ok() {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::Connecting
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(initial_state);
        let span = tracing::info_span!("subscription", topic = %topic);
        tokio::spawn(
            run_subscription(
                self.relay.clone(),
                topic.to_string(),
                first,
                handler,
                self.backoff.clone(),
                state_tx,
                shutdown_rx,
            )
            .instrument(span),
        );

        subscriptions.insert(
            topic.to_string(),
            ActiveSubscription {
                _shutdown: shutdown_tx,
                state: state_rx,
            },
        );
        info!("Subscribed to {}", topic);
    }

    /// Stop delivery for a topic. No-op if not subscribed.
    ///
    /// A payload already handed to the handler finishes delivering.
    pub async fn unsubscribe(&self, topic: &str) {
        if self.subscriptions.lock().await.remove(topic).is_some() {
            info!("Unsubscribed from {}", topic);
        } else {
            debug!("Unsubscribe from {}: not subscribed", topic);
        }
    }

    /// Current state of a topic's subscription
    pub async fn state(&self, topic: &str) -> Option<SubscriptionState> {
        self.subscriptions
            .lock()
            .await
            .get(topic)
            .map(|sub| *sub.state.borrow())
    }

    /// State watcher for a topic's subscription
    pub async fn watch_state(&self, topic: &str) -> Option<watch::Receiver<SubscriptionState>> {
        self.subscriptions
            .lock()
            .await
            .get(topic)
            .map(|sub| sub.state.clone())
    }

    /// Topics with a live subscription, sorted
    pub async fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Subscription loop for one topic
///
/// `first` is the result of the open attempted by [`PubSub::subscribe`].
async fn run_subscription(
    relay: Arc<dyn Relay>,
    topic: String,
    first: Result<RelayStream, RelayError>,
    handler: PayloadHandler,
    backoff: BackoffConfig,
    state: watch::Sender<SubscriptionState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut attempt: u32 = 0;
    let mut pending = Some(first);

    'outer: loop {
        let opened = match pending.take() {
            Some(opened) => opened,
            None => tokio::select! {
                biased;
                _ = &mut shutdown => break 'outer,
                opened = relay.open(&topic) => opened,
            },
        };

        match opened {
            Ok(mut stream) => {
                attempt = 0;
                state.send_replace(SubscriptionState::Subscribed);
                debug!("Relay stream open on {}", topic);

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = &mut shutdown => break 'outer,
                        next = stream.next() => next,
                    };
                    match next {
                        // Not raced against shutdown: in-flight delivery completes
                        Some(payload) => handler(payload).await,
                        None => break,
                    }
                }
                warn!("Relay stream on {} ended", topic);
            }
            Err(e) => {
                warn!("Failed to open relay stream on {}: {}", topic, e);
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff.delay(attempt);
        state.send_replace(SubscriptionState::Reconnecting { attempt });
        info!(
            "Reconnecting to relay topic {} in {:?} (attempt {})",
            topic, delay, attempt
        );

        tokio::select! {
            biased;
            _ = &mut shutdown => break 'outer,
            _ = tokio::time::sleep(delay) => {}
        }
        state.send_replace(SubscriptionState::Connecting);
    }

    state.send_replace(SubscriptionState::Closed);
    debug!("Subscription task for {} exited", topic);
}
