//! Shared fakes for unit tests

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::client::{Client, FrameWriter};
use crate::error::{RelayError, StoreError, WriteError};
use crate::relay::{LocalRelay, Relay, RelayStream};
use crate::store::MessageStore;
use crate::types::{ClientId, SenderId};

/// Writer that forwards every text frame to a channel
pub struct RecordingWriter {
    frames: mpsc::UnboundedSender<String>,
    pings: Arc<AtomicUsize>,
    fail: bool,
    closed: bool,
}

impl RecordingWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                frames: tx,
                pings: Arc::new(AtomicUsize::new(0)),
                fail: false,
                closed: false,
            },
            rx,
        )
    }

    /// Writer whose every write fails
    pub fn failing() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (mut writer, rx) = Self::new();
        writer.fail = true;
        (writer, rx)
    }

    pub fn ping_counter(&self) -> Arc<AtomicUsize> {
        self.pings.clone()
    }
}

#[async_trait]
impl FrameWriter for RecordingWriter {
    async fn write_text(&mut self, text: &str) -> Result<(), WriteError> {
        if self.closed || self.fail {
            return Err(WriteError::Closed);
        }
        self.frames
            .send(text.to_string())
            .map_err(|_| WriteError::Closed)
    }

    async fn write_ping(&mut self) -> Result<(), WriteError> {
        if self.closed || self.fail {
            return Err(WriteError::Closed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Writer whose text writes never complete, like a peer that stopped reading
#[derive(Default)]
pub struct StalledWriter {
    closes: Arc<AtomicUsize>,
}

impl StalledWriter {
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

#[async_trait]
impl FrameWriter for StalledWriter {
    async fn write_text(&mut self, _text: &str) -> Result<(), WriteError> {
        std::future::pending().await
    }

    async fn write_ping(&mut self) -> Result<(), WriteError> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Client with a recording writer
pub fn recording_client(addr: &str) -> (Arc<Client>, mpsc::UnboundedReceiver<String>) {
    let (writer, frames) = RecordingWriter::new();
    let client = Client::new(ClientId::new(addr), SenderId(format!("user-{}", addr)), writer);
    (Arc::new(client), frames)
}

/// Client whose writes always fail
pub fn failing_client(addr: &str) -> Arc<Client> {
    let (writer, _frames) = RecordingWriter::failing();
    Arc::new(Client::new(
        ClientId::new(addr),
        SenderId(format!("user-{}", addr)),
        writer,
    ))
}

/// Client whose socket writes never complete
pub fn stalled_client(addr: &str) -> Arc<Client> {
    Arc::new(Client::new(
        ClientId::new(addr),
        SenderId(format!("user-{}", addr)),
        StalledWriter::default(),
    ))
}

/// Store that remembers every saved message
#[derive(Default)]
pub struct RecordingStore {
    pub saved: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn save_message(&self, room_id: &str, content: &str) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Unavailable("test store down".to_string()));
        }
        self.saved
            .lock()
            .await
            .push((room_id.to_string(), content.to_string()));
        Ok(())
    }
}

/// Relay that fails its first `n` opens, then behaves like [`LocalRelay`]
pub struct FlakyRelay {
    inner: LocalRelay,
    failures_left: AtomicUsize,
    opens: AtomicUsize,
    fail_publish: bool,
}

impl FlakyRelay {
    pub fn failing_opens(n: usize) -> Self {
        Self {
            inner: LocalRelay::default(),
            failures_left: AtomicUsize::new(n),
            opens: AtomicUsize::new(0),
            fail_publish: false,
        }
    }

    pub fn failing_publishes() -> Self {
        Self {
            fail_publish: true,
            ..Self::failing_opens(0)
        }
    }

    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Relay for FlakyRelay {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        if self.fail_publish {
            return Err(RelayError::Transport("publish refused".to_string()));
        }
        self.inner.publish(topic, payload).await
    }

    async fn open(&self, topic: &str) -> Result<RelayStream, RelayError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(RelayError::Transport("connection refused".to_string()));
        }
        self.inner.open(topic).await
    }
}

/// Poll `check` until it holds, panicking after two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
