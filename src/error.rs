//! Error types for the chat server
//!
//! Defines application-level errors, persistence errors and delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::MessageCode;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (reported to the requesting client).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A newer connection for the same identity took over (ends this one)
    #[error("Connection replaced by a newer login")]
    Replaced,

    /// Malformed credential header or unparseable envelope (fatal)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed request the server refuses (reported, not fatal)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Backing store failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Envelope decoded as the wrong payload shape (programming error)
    #[error("Type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: MessageCode,
        found: MessageCode,
    },

    /// Outbound delivery failed
    #[error("Delivery failed: {0}")]
    Delivery(#[from] SendError),

    /// Client went away before the exchange finished
    #[error("Client disconnected")]
    Disconnected,

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,
}

/// Persistence collaborator errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row (or an equivalent one) already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No account carries the given username
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Another identity already owns the username
    #[error("Username taken: {0}")]
    UsernameTaken(String),

    /// Friend request addressed to oneself
    #[error("Cannot send a friend request to yourself")]
    SelfRequest,

    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store call exceeded its time budget
    #[error("Store call timed out")]
    Timeout,

    /// Store could not be reached (lock poisoned, worker gone, busy)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    ///
    /// `Timeout` is excluded: the timed-out call may still complete.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Message delivery errors
///
/// Occurs when an envelope cannot reach a connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// No live connection is bound to the identity
    #[error("Not connected")]
    NotConnected,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The outbound queue stayed full past the write timeout
    #[error("Write timed out")]
    Timeout,
}
