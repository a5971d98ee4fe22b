// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the relay server. Every tunable named in the design
/// (message size, backpressure, timeouts, pending-stream bounds, session
/// persistence) is an overridable flag/env var with the documented default.
#[derive(Debug, Clone, clap::Args)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8900, env = "RELAY_PORT")]
    pub port: u16,

    /// Maximum accepted frame size, in octets.
    #[arg(long, default_value_t = 1_048_576, env = "RELAY_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,

    /// Whether the token-bucket rate limiter is enabled.
    #[arg(long, default_value_t = true, env = "RELAY_RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: bool,

    /// Whether reconnecting clients may reclaim a prior peer ID via
    /// `sessionId`. When disabled, the session table is never consulted and
    /// every connection mints a fresh peer ID.
    #[arg(long, default_value_t = false, env = "RELAY_SESSION_PERSISTENCE")]
    pub session_persistence: bool,

    /// Topic used when the connection path is empty.
    #[arg(long, default_value = "none", env = "RELAY_DEFAULT_TOPIC")]
    pub default_topic: String,

    /// Outbound buffer threshold (bytes) above which a stream sender waits
    /// out backpressure.
    #[arg(long, default_value_t = 1_048_576, env = "RELAY_MAX_BUFFERED_AMOUNT")]
    pub max_buffered_amount: usize,

    /// Poll cadence while a stream sender waits out backpressure, in ms.
    #[arg(long, default_value_t = 10, env = "RELAY_BACKPRESSURE_DELAY_MS")]
    pub backpressure_delay_ms: u64,

    /// Cap on buffered chunks per stream before a local consumer registers.
    #[arg(long, default_value_t = 100, env = "RELAY_PENDING_STREAM_CAP")]
    pub pending_stream_cap: usize,

    /// Expiry for a stream's pending buffer, measured from its first chunk, in ms.
    #[arg(long, default_value_t = 10_000, env = "RELAY_PENDING_STREAM_EXPIRY_MS")]
    pub pending_stream_expiry_ms: u64,

    /// Default welcome-wait deadline, in ms.
    #[arg(long, default_value_t = 4_000, env = "RELAY_WELCOME_TIMEOUT_MS")]
    pub welcome_timeout_ms: u64,

    /// Default request/response correlation deadline, in ms.
    #[arg(long, default_value_t = 4_000, env = "RELAY_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Default peer-level close deadline, in ms.
    #[arg(long, default_value_t = 4_000, env = "RELAY_PEER_CLOSE_TIMEOUT_MS")]
    pub peer_close_timeout_ms: u64,

    /// Default transport-level close deadline, in ms.
    #[arg(long, default_value_t = 1_000, env = "RELAY_TRANSPORT_CLOSE_TIMEOUT_MS")]
    pub transport_close_timeout_ms: u64,

    /// Initial reconnect backoff interval, in ms.
    #[arg(long, default_value_t = 1_000, env = "RELAY_RECONNECT_INITIAL_MS")]
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect backoff interval, in ms.
    #[arg(long, default_value_t = 30_000, env = "RELAY_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8900,
            max_message_size: 1_048_576,
            rate_limit_enabled: true,
            session_persistence: false,
            default_topic: "none".to_owned(),
            max_buffered_amount: 1_048_576,
            backpressure_delay_ms: 10,
            pending_stream_cap: 100,
            pending_stream_expiry_ms: 10_000,
            welcome_timeout_ms: 4_000,
            request_timeout_ms: 4_000,
            peer_close_timeout_ms: 4_000,
            transport_close_timeout_ms: 1_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl RelayConfig {
    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }

    pub fn pending_stream_expiry(&self) -> Duration {
        Duration::from_millis(self.pending_stream_expiry_ms)
    }

    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_millis(self.welcome_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn peer_close_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_close_timeout_ms)
    }

    pub fn transport_close_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_close_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
