//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;

use crate::client::OutboundConfig;
use crate::handler::PumpConfig;
use crate::relay::BackoffConfig;

/// Multi-instance WebSocket chat relay
#[derive(Debug, Clone, Parser)]
#[command(name = "chat_relay", version, about)]
pub struct Config {
    /// Address to listen on; repeat to run several instances over one relay
    #[arg(
        short,
        long = "listen",
        env = "CHAT_LISTEN",
        value_delimiter = ',',
        default_value = "127.0.0.1:8080"
    )]
    pub listen: Vec<String>,

    /// Seconds without a frame or probe answer before a read times out
    #[arg(long, env = "CHAT_LIVENESS_SECS", default_value_t = 60)]
    pub liveness_secs: u64,

    /// Consecutive read timeouts tolerated before a connection is dropped
    #[arg(long, env = "CHAT_MAX_TIMEOUTS", default_value_t = 5)]
    pub max_timeouts: u32,

    /// Seconds to wait after a read timeout before reading again
    #[arg(long, env = "CHAT_TIMEOUT_COOLDOWN_SECS", default_value_t = 60)]
    pub timeout_cooldown_secs: u64,

    /// Seconds between liveness probes
    #[arg(long, env = "CHAT_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Decoded frames buffered per connection
    #[arg(long, env = "CHAT_INBOUND_QUEUE", default_value_t = 50)]
    pub inbound_queue: usize,

    /// Frames buffered per client before further sends are dropped
    #[arg(long, env = "CHAT_OUTBOUND_QUEUE", default_value_t = 64)]
    pub outbound_queue: usize,

    /// Seconds a single socket write may take before the client is closed
    #[arg(long, env = "CHAT_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// First relay reconnect delay in milliseconds
    #[arg(long, env = "CHAT_RELAY_BACKOFF_MS", default_value_t = 2000)]
    pub relay_backoff_ms: u64,

    /// Longest relay reconnect delay in milliseconds
    #[arg(long, env = "CHAT_RELAY_BACKOFF_MAX_MS", default_value_t = 30000)]
    pub relay_backoff_max_ms: u64,

    /// Undelivered payloads buffered per relay topic
    #[arg(long, env = "CHAT_RELAY_CAPACITY", default_value_t = 1024)]
    pub relay_capacity: usize,
}

impl Config {
    pub fn pump(&self) -> PumpConfig {
        PumpConfig {
            liveness: Duration::from_secs(self.liveness_secs),
            max_timeouts: self.max_timeouts.max(1),
            timeout_cooldown: Duration::from_secs(self.timeout_cooldown_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            inbound_queue: self.inbound_queue.max(1),
            outbound: OutboundConfig {
                queue: self.outbound_queue.max(1),
                write_timeout: Duration::from_secs(self.write_timeout_secs.max(1)),
            },
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        let initial = Duration::from_millis(self.relay_backoff_ms);
        BackoffConfig {
            initial,
            max: Duration::from_millis(self.relay_backoff_max_ms).max(initial),
        }
    }
}
