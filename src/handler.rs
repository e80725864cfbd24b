//! WebSocket connection handler
//!
//! Handles one client connection: the WebSocket handshake (which must carry
//! a `sender_id` query parameter), the read loop with its liveness policy,
//! decoding and dispatch of inbound messages to the [`RoomManager`], and
//! cleanup when the connection ends.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn, Instrument};
use url::form_urlencoded;

use crate::client::{Client, OutboundConfig, WsFrameWriter};
use crate::error::AppError;
use crate::manager::RoomManager;
use crate::message::{Action, ChatMessage, PAYLOAD_DELIMITER};
use crate::store::MessageStore;
use crate::types::{ClientId, SenderId};

/// Liveness and queueing settings for one connection
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// A read with no frame or probe answer for this long times out
    pub liveness: Duration,
    /// Consecutive read timeouts tolerated before the connection is dropped
    pub max_timeouts: u32,
    /// Wait between a read timeout and the next read attempt
    pub timeout_cooldown: Duration,
    /// Interval between liveness probes sent to the peer
    pub ping_interval: Duration,
    /// Capacity of the decoded-frame queue between reader and dispatcher
    pub inbound_queue: usize,
    /// Outbound queue and write deadline for the client's writer task
    pub outbound: OutboundConfig,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            liveness: Duration::from_secs(60),
            max_timeouts: 5,
            timeout_cooldown: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            inbound_queue: 50,
            outbound: OutboundConfig::default(),
        }
    }
}

/// Everything a connection needs from its server instance
#[derive(Clone)]
pub struct ConnectionContext {
    pub rooms: Arc<RoomManager>,
    pub store: Arc<dyn MessageStore>,
    pub config: PumpConfig,
}

/// Why the read side of a connection stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadExit {
    /// Peer closed the connection, or the stream ended
    Closed,
    /// Too many consecutive read timeouts
    TimedOut,
    /// Non-timeout read failure
    Failed(String),
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, then pumps the connection until it
/// ends. A request without a `sender_id` is answered with 400 and no
/// domain state is created.
pub async fn handle_connection(stream: TcpStream, ctx: ConnectionContext) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut sender_id = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match req.uri().query().and_then(sender_id_from_query) {
            Some(id) => {
                sender_id = Some(id);
                Ok(resp)
            }
            None => Err(reject("sender_id is required")),
        }
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            if sender_id.is_none() {
                warn!("Connection from {} rejected: sender_id is missing", peer_addr);
                return Err(AppError::MissingSenderId);
            }
            return Err(e.into());
        }
    };
    let Some(sender_id) = sender_id else {
        return Err(AppError::MissingSenderId);
    };

    info!(
        "WebSocket connection from {}, sender_id: {}",
        peer_addr, sender_id
    );

    let (ws_sender, ws_receiver) = ws_stream.split();
    let client = Arc::new(Client::with_outbound(
        ClientId::new(peer_addr),
        sender_id,
        WsFrameWriter::new(ws_sender),
        ctx.config.outbound,
    ));

    let exit = run_pump(client, ws_receiver, ctx).await;
    debug!("Connection ended: {:?}", exit);
    Ok(())
}

/// Pump one connection until it ends
///
/// The reader decodes frames into a bounded queue; a single consumer
/// dispatches them in order and sends liveness probes. Whichever way the
/// pump ends (including the future being dropped), the connection is
/// closed and the client removed from every room exactly once.
pub async fn run_pump<S>(client: Arc<Client>, stream: S, ctx: ConnectionContext) -> ReadExit
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send,
{
    let span = tracing::info_span!("connection", client = %client.id, sender = %client.sender_id);
    let cleanup = Cleanup::new(client.clone(), ctx.rooms.clone());

    async move {
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(ctx.config.inbound_queue.max(1));

        let reading = read_frames(stream, frame_tx, &ctx.config);
        let consuming = async {
            let mut probe = tokio::time::interval_at(
                tokio::time::Instant::now() + ctx.config.ping_interval,
                ctx.config.ping_interval,
            );
            probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = dispatch(&client, &ctx, &text).await {
                                warn!("Dropping frame from {}: {}", client.id, e);
                            }
                        }
                        None => break,
                    },
                    _ = probe.tick() => {
                        if let Err(e) = client.ping() {
                            debug!("Liveness probe to {} failed: {}", client.id, e);
                        }
                    }
                }
            }
        };

        let (exit, ()) = tokio::join!(reading, consuming);
        cleanup.run().await;
        exit
    }
    .instrument(span)
    .await
}

/// Read loop: frames in, decoded text onto the queue
///
/// Every received frame (data, ping or pong) restarts the liveness window.
async fn read_frames<S>(mut stream: S, frames: mpsc::Sender<String>, config: &PumpConfig) -> ReadExit
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut timeouts: u32 = 0;

    loop {
        let msg = match tokio::time::timeout(config.liveness, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(None) => return ReadExit::Closed,
            Ok(Some(Err(e))) if !is_timeout(&e) => {
                warn!("WebSocket read error (non-timeout): {}", e);
                return ReadExit::Failed(e.to_string());
            }
            Ok(Some(Err(_))) | Err(_) => {
                timeouts += 1;
                warn!(
                    "WebSocket read timeout ({}/{})",
                    timeouts, config.max_timeouts
                );
                if timeouts >= config.max_timeouts {
                    warn!("Maximum timeouts reached, closing connection");
                    return ReadExit::TimedOut;
                }
                tokio::time::sleep(config.timeout_cooldown).await;
                continue;
            }
        };

        timeouts = 0;
        let text = match msg {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping non UTF-8 binary frame: {}", e);
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                debug!("Liveness acknowledged");
                continue;
            }
            Message::Close(_) => {
                debug!("Client sent close frame");
                return ReadExit::Closed;
            }
            Message::Frame(_) => continue,
        };

        // Blocks when the dispatcher is behind
        if frames.send(text).await.is_err() {
            return ReadExit::Closed;
        }
    }
}

/// Decode one frame and route it by action
pub async fn dispatch(
    client: &Arc<Client>,
    ctx: &ConnectionContext,
    text: &str,
) -> Result<(), AppError> {
    let mut msg = ChatMessage::decode(text)?;

    if msg.room_id.is_empty() {
        return Err(AppError::EmptyRoomId);
    }
    if msg.room_id.contains(PAYLOAD_DELIMITER) {
        return Err(AppError::InvalidRoomId(msg.room_id));
    }
    msg.sender_id = Some(client.sender_id.to_string());

    match msg.action() {
        Action::Join => ctx.rooms.join_room(client.clone(), &msg.room_id).await,
        Action::Leave => ctx.rooms.leave_room(&client.id, &msg.room_id).await,
        Action::Message => process_message(ctx, &msg).await?,
        Action::Unknown => return Err(AppError::UnknownAction(msg.action)),
    }
    Ok(())
}

/// Save a chat message, then broadcast it
///
/// A failed save is logged and does not stop the broadcast.
async fn process_message(ctx: &ConnectionContext, msg: &ChatMessage) -> Result<(), AppError> {
    let sender = msg.sender_id.as_deref().unwrap_or_default();
    match ctx.store.save_message(&msg.room_id, &msg.content).await {
        Ok(()) => debug!("Message from {} saved", sender),
        Err(e) => warn!("Failed to save message from {}: {}", sender, e),
    }

    ctx.rooms.broadcast_message(&msg.room_id, &msg.content).await?;
    debug!("Message from {} broadcast to {}", sender, msg.room_id);
    Ok(())
}

/// Extract a non-empty `sender_id` from a query string
///
/// The value is percent-decoded, with `+` read as a space.
pub fn sender_id_from_query(query: &str) -> Option<SenderId> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "sender_id")
        .and_then(|(_, value)| SenderId::parse(&value))
}

/// Helper: build a 400 handshake response
fn reject(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

/// Helper: does this read error mean the deadline passed
fn is_timeout(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        )
    )
}

/// Connection teardown that runs exactly once
///
/// `run` performs it in place; if the pump is dropped before that, the
/// teardown is spawned from `Drop`.
struct Cleanup {
    client: Arc<Client>,
    rooms: Arc<RoomManager>,
    done: bool,
}

impl Cleanup {
    fn new(client: Arc<Client>, rooms: Arc<RoomManager>) -> Self {
        Self {
            client,
            rooms,
            done: false,
        }
    }

    async fn run(mut self) {
        teardown(self.client.clone(), self.rooms.clone()).await;
        self.done = true;
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown(self.client.clone(), self.rooms.clone()));
            }
            Err(_) => warn!("No runtime to clean up client {}", self.client.id),
        }
    }
}

async fn teardown(client: Arc<Client>, rooms: Arc<RoomManager>) {
    rooms.remove_client(&client.id).await;
    client.close();
    info!("Client {} disconnected", client.id);
}
