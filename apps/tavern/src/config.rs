use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::mux::{MuxConfig, DEFAULT_HISTORY_SIZE, DEFAULT_SUBSCRIBER_BUFFER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PubSubBackend {
    /// Single-process backplane; no cross-replica fan-out.
    Memory,
    /// Google Cloud Pub/Sub (or its emulator via PUBSUB_EMULATOR_HOST).
    Gcp,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tavern")]
#[command(about = "Tavern portal server")]
pub struct ServerConfig {
    /// gRPC listen address
    #[arg(long, env = "TAVERN_LISTEN_ADDR", default_value = "127.0.0.1:8000")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "TAVERN_PUBSUB_BACKEND", value_enum, default_value_t = PubSubBackend::Memory)]
    pub pubsub_backend: PubSubBackend,

    /// Required for the gcp backend
    #[arg(long, env = "TAVERN_GCP_PROJECT_ID")]
    pub gcp_project_id: Option<String>,

    /// Idle expiry for backplane subscriptions
    #[arg(long, env = "TAVERN_SUBSCRIPTION_TTL_SECS", default_value_t = 86_400)]
    pub subscription_ttl_secs: u64,

    /// Motes of history kept per topic for late subscribers
    #[arg(long, env = "TAVERN_HISTORY_SIZE", default_value_t = DEFAULT_HISTORY_SIZE)]
    pub history_size: usize,

    /// Optional cap on the payload bytes kept per topic
    #[arg(long, env = "TAVERN_HISTORY_BYTES")]
    pub history_bytes: Option<usize>,

    #[arg(long, env = "TAVERN_SUBSCRIBER_BUFFER", default_value_t = DEFAULT_SUBSCRIBER_BUFFER)]
    pub subscriber_buffer: usize,

    /// How long a publish may block on a full subscriber (50-250)
    #[arg(long, env = "TAVERN_DISPATCH_WINDOW_MS", default_value_t = 100)]
    pub dispatch_window_ms: u64,

    /// Interval between PING motes sent to agents; 0 disables
    #[arg(long, env = "TAVERN_AGENT_KEEPALIVE_SECS", default_value_t = 30)]
    pub agent_keepalive_secs: u64,

    /// Accepted values of the x-tavern-auth header; empty accepts everyone
    #[arg(long = "api-token", env = "TAVERN_API_TOKENS", value_delimiter = ',')]
    pub api_tokens: Vec<String>,

    /// Let the in-memory store open portals for task ids it has never seen
    #[arg(long, env = "TAVERN_ACCEPT_UNKNOWN_TASKS")]
    pub accept_unknown_tasks: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info,tavern=debug")]
    pub log_filter: String,
}

impl ServerConfig {
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            history_size: self.history_size,
            history_bytes: self.history_bytes,
            subscriber_buffer: self.subscriber_buffer,
            dispatch_window: Duration::from_millis(self.dispatch_window_ms),
            subscription_ttl: Duration::from_secs(self.subscription_ttl_secs),
            ..MuxConfig::default()
        }
    }

    pub fn agent_keepalive(&self) -> Option<Duration> {
        (self.agent_keepalive_secs > 0).then(|| Duration::from_secs(self.agent_keepalive_secs))
    }

    pub fn api_tokens(&self) -> HashSet<String> {
        self.api_tokens
            .iter()
            .map(|token| token.trim())
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }
}
