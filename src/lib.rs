//! Friend/Chat WebSocket Server Library
//!
//! A real-time social chat service built with tokio-tungstenite. Clients
//! authenticate over one persistent connection, exchange friend requests and
//! chat messages, and receive presence notifications from their friends.
//!
//! # Features
//! - Identity from the `Authorization` header, login handshake over the socket
//! - One-time welcome message, full content sync on login
//! - User search, friend requests (accept / reject)
//! - Chat between friends with stored history
//! - Online/offline presence for friends
//! - In-memory or SQLite persistence
//!
//! # Architecture
//! - `SessionRegistry` and `ConnectionManager` are lock-guarded tables owned
//!   by `AppState` and passed by reference to every task
//! - Each connection runs one `handler` task plus a writer task draining its
//!   outbound queue
//! - Multi-party effects are sent as `BroadcastEvent`s to the `Dispatcher`,
//!   which fans each one out with one delivery task per recipient
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use friend_chat_server::{open_store, serve, AppState, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let store = open_store(&config).unwrap();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!
//!     let (state, dispatcher) = AppState::new(store, config);
//!     tokio::spawn(dispatcher.run());
//!     serve(listener, state).await;
//! }
//! ```

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod content;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use auth::{credential_header, parse_credential_header, AuthState, Handshake, HandshakeOutcome};
pub use broadcast::{BroadcastEvent, DispatchStats, Dispatcher};
pub use config::ServerConfig;
pub use connection::{ConnectionHandle, ConnectionManager};
pub use error::{AppError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{ClientRequest, Envelope, ErrorCode, ErrorInfo, MessageCode, Payload};
pub use server::{open_store, serve, AppState};
pub use session::{SessionRecord, SessionRegistry};
pub use store::{MemoryStore, Persistence, RetryPolicy, SqliteStore, Store};
pub use types::{ApiKey, ConnectionId, FriendshipId, Parties, RequestId};
