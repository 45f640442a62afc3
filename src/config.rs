//! Server configuration
//!
//! Command line flags with environment variable fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::store::RetryPolicy;

/// Longest history window accepted for `history_days`
pub const MAX_HISTORY_DAYS: i64 = 3650;

#[derive(Debug, Clone, Parser)]
#[command(name = "friend_chat_server", version, about = "Friend/chat WebSocket server")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "CHAT_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// SQLite database path; in-memory store when absent
    #[arg(long, env = "CHAT_DATABASE")]
    pub database: Option<PathBuf>,

    /// Days of message history sent on login
    #[arg(
        long,
        env = "CHAT_HISTORY_DAYS",
        default_value_t = 3,
        value_parser = clap::value_parser!(i64).range(0..=MAX_HISTORY_DAYS)
    )]
    pub history_days: i64,

    /// Bound on a single outbound send
    #[arg(long, env = "CHAT_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Broadcast event channel capacity
    #[arg(long, env = "CHAT_EVENT_BUFFER", default_value_t = 256)]
    pub event_buffer: usize,

    /// Per-connection outbound queue capacity
    #[arg(long, env = "CHAT_OUTBOUND_BUFFER", default_value_t = 32)]
    pub outbound_buffer: usize,

    /// Concurrent broadcast deliveries
    #[arg(long, env = "CHAT_MAX_DELIVERIES", default_value_t = 64)]
    pub max_deliveries: usize,

    /// Attempts per store call, counting the first
    #[arg(long, env = "CHAT_STORE_ATTEMPTS", default_value_t = 3)]
    pub store_attempts: u32,

    #[arg(long, env = "CHAT_STORE_BACKOFF_MS", default_value_t = 50)]
    pub store_backoff_ms: u64,

    #[arg(long, env = "CHAT_STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            database: None,
            history_days: 3,
            write_timeout_ms: 5000,
            event_buffer: 256,
            outbound_buffer: 32,
            max_deliveries: 64,
            store_attempts: 3,
            store_backoff_ms: 50,
            store_timeout_ms: 2000,
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn history(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_days.clamp(0, MAX_HISTORY_DAYS))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_attempts.max(1),
            backoff: Duration::from_millis(self.store_backoff_ms),
            timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }
}
