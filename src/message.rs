//! Message protocol definitions
//!
//! Every frame in both directions is an [`Envelope`]: a [`MessageCode`], a
//! human-readable message, an optional error and a JSON payload. Each
//! payload-bearing code has exactly one payload struct, bound at compile time
//! through the [`Payload`] trait, so encoding picks the code from the type and
//! decoding refuses a payload type that does not belong to the code.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, SendError, StoreError};
use crate::types::{FriendshipId, RequestId};

/// Closed set of wire message codes
///
/// Unrecognised codes decode as `Unknown` and are ignored by the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCode {
    /// Server asks for credentials
    LoginRequired,
    /// Client submits credentials
    SubmitCredentials,
    /// Username or password was empty
    CredentialsRequired,
    /// Credentials did not match, or the username is taken
    LoginRejected,
    /// Handshake finished
    LoginAccepted,
    /// One-time greeting after the first successful login
    Welcome,
    SearchUsers,
    SearchResults,
    FriendRequestSubmit,
    FriendRequestResult,
    FriendAcceptSubmit,
    FriendAcceptResult,
    ChatSend,
    ChatReceive,
    PresenceOnline,
    PresenceOffline,
    /// Full content sync sent right after login
    AllContent,
    /// Friends and pending requests changed
    FriendContentUpdate,
    /// A chat message could not be stored or routed
    DeliveryFailed,
    Logout,
    LoggedOut,
    /// Request failed server-side (persistence, protocol)
    ServerError,
    /// Forward-compatible catch-all for codes this build does not know.
    #[serde(other)]
    Unknown,
}

/// Client-visible error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    AuthError,
    PersistenceError,
    DeliveryFailed,
    TypeMismatch,
    InvalidRequest,
    InternalError,
}

/// Error attached to an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Convert AppError to ErrorInfo for client notification
impl From<&AppError> for ErrorInfo {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Protocol(_) | AppError::Json(_) => ErrorCode::ProtocolError,
            AppError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            AppError::Persistence(StoreError::UnknownUser(_))
            | AppError::Persistence(StoreError::AlreadyExists(_))
            | AppError::Persistence(StoreError::NotFound(_))
            | AppError::Persistence(StoreError::SelfRequest) => ErrorCode::InvalidRequest,
            AppError::Persistence(StoreError::UsernameTaken(_)) => ErrorCode::AuthError,
            AppError::Persistence(_) => ErrorCode::PersistenceError,
            AppError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            AppError::Delivery(SendError::NotConnected)
            | AppError::Delivery(SendError::ChannelClosed)
            | AppError::Delivery(SendError::Timeout) => ErrorCode::DeliveryFailed,
            // Fatal transport errors are not typically reported (connection closes)
            _ => ErrorCode::InternalError,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: MessageCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A payload shape bound to exactly one message code
pub trait Payload: Serialize + DeserializeOwned {
    const CODE: MessageCode;
}

impl Envelope {
    /// Envelope without payload
    pub fn notice(code: MessageCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Envelope whose code is selected by the payload type
    pub fn with_payload<P: Payload>(message: impl Into<String>, payload: &P) -> Result<Self, AppError> {
        Ok(Self {
            code: P::CODE,
            message: message.into(),
            error: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Envelope reporting a failure
    pub fn failure(code: MessageCode, error: ErrorInfo) -> Self {
        Self {
            code,
            message: error.message.clone(),
            error: Some(error),
            payload: serde_json::Value::Null,
        }
    }

    /// Decode the payload as `P`
    ///
    /// Fails with `TypeMismatch` when the envelope's code does not belong to `P`.
    pub fn decode<P: Payload>(&self) -> Result<P, AppError> {
        if self.code != P::CODE {
            return Err(AppError::TypeMismatch {
                expected: P::CODE,
                found: self.code,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Username and password submitted during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl Payload for Credentials {
    const CODE: MessageCode = MessageCode::SubmitCredentials;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub prefix: String,
}

impl Payload for SearchQuery {
    const CODE: MessageCode = MessageCode::SearchUsers;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub usernames: Vec<String>,
}

impl Payload for SearchResults {
    const CODE: MessageCode = MessageCode::SearchResults;
}

/// Friend request addressed by username
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestForm {
    pub username: String,
}

impl Payload for FriendRequestForm {
    const CODE: MessageCode = MessageCode::FriendRequestSubmit;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestResult {
    pub ok: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl Payload for FriendRequestResult {
    const CODE: MessageCode = MessageCode::FriendRequestResult;
}

/// Accept or reject a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendDecision {
    pub request_id: RequestId,
    pub accept: bool,
}

impl Payload for FriendDecision {
    const CODE: MessageCode = MessageCode::FriendAcceptSubmit;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendDecisionResult {
    pub ok: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendship_id: Option<FriendshipId>,
}

impl Payload for FriendDecisionResult {
    const CODE: MessageCode = MessageCode::FriendAcceptResult;
}

/// Outgoing chat text, receiver addressed by username
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDraft {
    pub receiver: String,
    pub text: String,
}

impl Payload for ChatDraft {
    const CODE: MessageCode = MessageCode::ChatSend;
}

/// Stored chat message as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub sender: String,
    pub receiver: String,
    pub date: String,
}

impl Payload for ChatMessage {
    const CODE: MessageCode = MessageCode::ChatReceive;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineNotice {
    pub username: String,
}

impl Payload for OnlineNotice {
    const CODE: MessageCode = MessageCode::PresenceOnline;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineNotice {
    pub username: String,
}

impl Payload for OfflineNotice {
    const CODE: MessageCode = MessageCode::PresenceOffline;
}

/// Friend entry with live presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub username: String,
    pub active: bool,
    pub message: String,
}

/// Pending friend request seen from one party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// The other party's username
    pub username: String,
    pub request_id: RequestId,
    /// True when this client sent the request
    pub from_client: bool,
}

/// Everything a client needs after login
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserContent {
    pub friends: Vec<Friend>,
    pub friend_requests: Vec<PendingRequest>,
    /// Recent messages keyed by friend username
    pub messages: BTreeMap<String, Vec<ChatMessage>>,
}

impl Payload for UserContent {
    const CODE: MessageCode = MessageCode::AllContent;
}

/// Friends and requests only, sent after friendship changes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FriendContent {
    pub friends: Vec<Friend>,
    pub friend_requests: Vec<PendingRequest>,
}

impl Payload for FriendContent {
    const CODE: MessageCode = MessageCode::FriendContentUpdate;
}

/// Display format for message timestamps
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

/// Client → Server request
///
/// Typed view over the envelopes a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    SubmitCredentials(Credentials),
    SearchUsers(SearchQuery),
    FriendRequest(FriendRequestForm),
    FriendDecision(FriendDecision),
    ChatSend(ChatDraft),
    Logout,
}

impl ClientRequest {
    /// Interpret an inbound envelope
    ///
    /// Returns `Ok(None)` for codes a client never sends (including `Unknown`).
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, AppError> {
        let request = match envelope.code {
            MessageCode::SubmitCredentials => Self::SubmitCredentials(envelope.decode()?),
            MessageCode::SearchUsers => Self::SearchUsers(envelope.decode()?),
            MessageCode::FriendRequestSubmit => Self::FriendRequest(envelope.decode()?),
            MessageCode::FriendAcceptSubmit => Self::FriendDecision(envelope.decode()?),
            MessageCode::ChatSend => Self::ChatSend(envelope.decode()?),
            MessageCode::Logout => Self::Logout,
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    /// Encode as the envelope a client would send
    pub fn to_envelope(&self) -> Result<Envelope, AppError> {
        match self {
            Self::SubmitCredentials(p) => Envelope::with_payload("", p),
            Self::SearchUsers(p) => Envelope::with_payload("", p),
            Self::FriendRequest(p) => Envelope::with_payload("", p),
            Self::FriendDecision(p) => Envelope::with_payload("", p),
            Self::ChatSend(p) => Envelope::with_payload("", p),
            Self::Logout => Ok(Envelope::notice(MessageCode::Logout, "")),
        }
    }

    pub fn code(&self) -> MessageCode {
        match self {
            Self::SubmitCredentials(_) => MessageCode::SubmitCredentials,
            Self::SearchUsers(_) => MessageCode::SearchUsers,
            Self::FriendRequest(_) => MessageCode::FriendRequestSubmit,
            Self::FriendDecision(_) => MessageCode::FriendAcceptSubmit,
            Self::ChatSend(_) => MessageCode::ChatSend,
            Self::Logout => MessageCode::Logout,
        }
    }
}
