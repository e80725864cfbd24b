//! Client struct definition
//!
//! Represents one accepted connection: its transport id, the sender
//! identity supplied at connect time, and a bounded outbound queue
//! drained by a single writer task that owns the write half of the socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::types::{ClientId, SenderId};

/// Write half of a duplex connection
///
/// The pump owns the read half; everything that writes to a client
/// goes through this trait so fanout can be exercised without sockets.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame
    async fn write_text(&mut self, text: &str) -> Result<(), WriteError>;

    /// Send a liveness probe
    async fn write_ping(&mut self) -> Result<(), WriteError>;

    /// Close the connection. Calling it twice is harmless.
    async fn close(&mut self);
}

/// [`FrameWriter`] over the sink half of a split WebSocket stream
pub struct WsFrameWriter<S> {
    sink: S,
    closed: bool,
}

impl<S> WsFrameWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> FrameWriter for WsFrameWriter<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn write_text(&mut self, text: &str) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.sink.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    async fn write_ping(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.sink.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Peer may already be gone
        let _ = self.sink.close().await;
    }
}

/// Outbound queue settings for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundConfig {
    /// Frames buffered for the writer task; sends beyond this are dropped
    pub queue: usize,
    /// A single frame write that takes longer than this closes the client
    pub write_timeout: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue: 64,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Frame queued for the writer task
enum Outbound {
    Text(Arc<str>),
    Ping,
}

/// Connected client information
pub struct Client {
    /// Transport-level identifier (peer address)
    pub id: ClientId,
    /// Identity supplied by the client at connect time
    pub sender_id: SenderId,
    /// Frames waiting for the writer task
    outbound: mpsc::Sender<Outbound>,
    /// Set once to stop the writer task
    closing: watch::Sender<bool>,
}

impl Client {
    /// Create a new client with the default outbound limits
    pub fn new(id: ClientId, sender_id: SenderId, writer: impl FrameWriter + 'static) -> Self {
        Self::with_outbound(id, sender_id, writer, OutboundConfig::default())
    }

    /// Create a new client and spawn the task that writes its frames
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_outbound(
        id: ClientId,
        sender_id: SenderId,
        writer: impl FrameWriter + 'static,
        config: OutboundConfig,
    ) -> Self {
        let (outbound, queue) = mpsc::channel(config.queue.max(1));
        let (closing, closing_rx) = watch::channel(false);
        tokio::spawn(write_loop(
            id.clone(),
            Box::new(writer),
            queue,
            closing_rx,
            config.write_timeout,
        ));
        Self {
            id,
            sender_id,
            outbound,
            closing,
        }
    }

    /// Queue a text frame for this client
    ///
    /// Never waits: a full queue drops the frame and reports `Full`.
    pub fn send_text(&self, text: &str) -> Result<(), WriteError> {
        self.enqueue(Outbound::Text(Arc::from(text)))
    }

    /// Queue a liveness probe
    pub fn ping(&self) -> Result<(), WriteError> {
        self.enqueue(Outbound::Ping)
    }

    /// Close the connection
    ///
    /// Returns at once. The writer task stops, abandoning any write in
    /// progress, and closes the socket. Calling it twice is harmless.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    /// Whether the connection has been closed or its writer has stopped
    pub fn is_closed(&self) -> bool {
        *self.closing.borrow() || self.outbound.is_closed()
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), WriteError> {
        if *self.closing.borrow() {
            return Err(WriteError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::Full,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.closing.send_replace(true);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("sender_id", &self.sender_id)
            .finish_non_exhaustive()
    }
}

/// Writer task: the only place a client's socket is written
///
/// Ends when the client is closed, the queue is dropped, a write fails or
/// a write outlives `write_timeout`. The socket is closed on the way out.
async fn write_loop(
    id: ClientId,
    mut writer: Box<dyn FrameWriter>,
    mut queue: mpsc::Receiver<Outbound>,
    mut closing: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed(&mut closing) => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let write = async {
            match &frame {
                Outbound::Text(text) => writer.write_text(text).await,
                Outbound::Ping => writer.write_ping().await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = closed(&mut closing) => break,
            result = tokio::time::timeout(write_timeout, write) => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to client {} failed: {}", id, e);
                break;
            }
            Err(_) => {
                warn!("Write to client {} timed out after {:?}", id, write_timeout);
                break;
            }
        }
    }

    // Stop accepting frames before the socket goes away
    queue.close();
    if tokio::time::timeout(write_timeout, writer.close()).await.is_err() {
        warn!("Closing client {} timed out", id);
    }
    debug!("Writer for client {} stopped", id);
}

/// Resolves once the client is closed or dropped
async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}
