//! Chat relay - Entry Point
//!
//! Starts one instance per listen address, all sharing one relay, and
//! accepts connections until interrupted.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{Config, Instance, LocalRelay, LogMessageStore, MessageStore, Relay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let config = Config::parse();
    info!("Loaded configuration: {:?}", config);

    let relay: Arc<dyn Relay> = Arc::new(LocalRelay::new(config.relay_capacity));
    let store: Arc<dyn MessageStore> = Arc::new(LogMessageStore);

    for addr in &config.listen {
        let listener = TcpListener::bind(addr).await?;
        let instance = Instance::new(relay.clone(), store.clone(), config.pump(), config.backoff());
        info!("Instance {} bound to {}", instance.id, addr);
        tokio::spawn(instance.serve(listener));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    Ok(())
}
