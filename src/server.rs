//! Server instance
//!
//! One instance = one listener, one [`RoomManager`] and one connection pump
//! per accepted socket. Several instances sharing a relay behave like
//! separate server processes: each keeps its own room registry and sees
//! the others' traffic only through the relay.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, Instrument};

use crate::handler::{handle_connection, ConnectionContext, PumpConfig};
use crate::manager::RoomManager;
use crate::relay::{BackoffConfig, PubSub, Relay};
use crate::store::MessageStore;
use crate::types::InstanceId;

/// A chat server instance attached to a relay
#[derive(Clone)]
pub struct Instance {
    pub id: InstanceId,
    ctx: ConnectionContext,
}

impl Instance {
    /// Create an instance with its own room registry
    pub fn new(
        relay: Arc<dyn Relay>,
        store: Arc<dyn MessageStore>,
        pump: PumpConfig,
        backoff: BackoffConfig,
    ) -> Self {
        let rooms = RoomManager::new(PubSub::new(relay, backoff));
        Self {
            id: InstanceId::new(),
            ctx: ConnectionContext {
                rooms,
                store,
                config: pump,
            },
        }
    }

    /// This instance's room registry
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }

    /// Accept connections forever, one handler task per connection
    pub async fn serve(self, listener: TcpListener) {
        let span = tracing::info_span!("instance", id = %self.id);
        async move {
            match listener.local_addr() {
                Ok(addr) => info!("Instance listening on {}", addr),
                Err(e) => error!("Listener has no local address: {}", e),
            }

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let ctx = self.ctx.clone();

                        // Spawn handler task for each connection
                        tokio::spawn(
                            async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    error!("Connection handler error: {}", e);
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
