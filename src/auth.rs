//! Authentication
//!
//! Two layers:
//! - the credential header on the upgrade request names the identity
//!   (`Authorization: Basic base64(<api-key>:<secret>)`)
//! - the handshake state machine runs over the open connection and must reach
//!   `LoggedIn` before any other request is served

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::error::{AppError, StoreError};
use crate::message::{Credentials, Envelope, ErrorInfo, MessageCode};
use crate::session::SessionRegistry;
use crate::types::ApiKey;

/// Extract the identity from an `Authorization` header value
pub fn parse_credential_header(value: Option<&str>) -> Result<ApiKey, AppError> {
    let value = value.ok_or_else(|| AppError::Protocol("missing Authorization header".into()))?;
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or_else(|| AppError::Protocol("Auth key incorrectly coded".into()))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AppError::Protocol("Auth key incorrectly coded".into()))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| AppError::Protocol("Auth key incorrectly coded".into()))?;

    match decoded.split_once(':') {
        Some((key, _)) if !key.is_empty() => Ok(ApiKey::new(key)),
        _ => Err(AppError::Protocol("Auth key incorrectly coded".into())),
    }
}

/// Build the header value a client sends for `key`
pub fn credential_header(key: &ApiKey, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", key, secret)))
}

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingCredentials,
    LoginRejected,
    LoggedIn,
    Failed,
}

/// Result of a completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Number of `SubmitCredentials` messages processed
    pub attempts: u32,
    /// The account was created by this handshake
    pub account_created: bool,
    /// The one-time welcome went out on this connection
    pub welcomed: bool,
}

enum Verdict {
    Created,
    Matched,
    Rejected(String),
}

/// Per-connection login state machine
///
/// Reads client envelopes until credentials are accepted. Out-of-order
/// messages are discarded and there is no attempt limit.
pub struct Handshake<'a> {
    key: &'a ApiKey,
    sessions: &'a SessionRegistry,
    outbound: &'a ConnectionHandle,
    state: AuthState,
    attempts: u32,
}

impl<'a> Handshake<'a> {
    pub fn new(key: &'a ApiKey, sessions: &'a SessionRegistry, outbound: &'a ConnectionHandle) -> Self {
        Self {
            key,
            sessions,
            outbound,
            state: AuthState::AwaitingCredentials,
            attempts: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Drive the handshake to `LoggedIn` or `Failed`
    pub async fn run<S>(&mut self, inbound: &mut S) -> Result<HandshakeOutcome, AppError>
    where
        S: Stream<Item = Result<Envelope, AppError>> + Unpin,
    {
        let account_created = match self.authenticate(inbound).await {
            Ok(created) => created,
            Err(e) => {
                self.state = AuthState::Failed;
                return Err(e);
            }
        };

        self.outbound
            .send(Envelope::notice(MessageCode::LoginAccepted, "Login successful"))
            .await?;
        info!(key = %self.key, attempts = self.attempts, "Login accepted");

        let welcomed = self.sessions.claim_welcome(self.key).await;
        if welcomed {
            self.outbound
                .send(Envelope::notice(MessageCode::Welcome, "Welcome to the server!"))
                .await?;

            if let Err(e) = self.sessions.persist_welcome_sent(self.key).await {
                warn!(key = %self.key, error = %e, "Failed to persist welcome flag");
                let err = AppError::Persistence(e);
                self.outbound
                    .send(Envelope::failure(MessageCode::ServerError, ErrorInfo::from(&err)))
                    .await?;
            }
        }

        Ok(HandshakeOutcome {
            attempts: self.attempts,
            account_created,
            welcomed,
        })
    }

    /// Returns whether the account was created
    async fn authenticate<S>(&mut self, inbound: &mut S) -> Result<bool, AppError>
    where
        S: Stream<Item = Result<Envelope, AppError>> + Unpin,
    {
        self.state = AuthState::AwaitingCredentials;
        self.outbound
            .send(Envelope::notice(MessageCode::LoginRequired, "Login details required"))
            .await?;

        loop {
            let envelope = match inbound.next().await {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => return Err(e),
                None => return Err(AppError::Disconnected),
            };

            // Anything but credentials is dropped, to tolerate retransmission
            if envelope.code != MessageCode::SubmitCredentials {
                debug!(key = %self.key, code = ?envelope.code, "Ignoring message before login");
                continue;
            }

            let credentials: Credentials = envelope
                .decode()
                .map_err(|e| AppError::Protocol(format!("malformed credentials: {}", e)))?;
            self.attempts += 1;

            if !credentials.is_complete() {
                self.outbound
                    .send(Envelope::notice(
                        MessageCode::CredentialsRequired,
                        "Username and password are required",
                    ))
                    .await?;
                continue;
            }

            let created = match self.check(&credentials).await? {
                Verdict::Created => true,
                Verdict::Matched => false,
                Verdict::Rejected(reason) => {
                    self.state = AuthState::LoginRejected;
                    debug!(key = %self.key, attempt = self.attempts, "Login rejected");
                    self.outbound
                        .send(Envelope::notice(MessageCode::LoginRejected, reason))
                        .await?;
                    self.state = AuthState::AwaitingCredentials;
                    continue;
                }
            };

            // A newer connection for this identity may have taken over meanwhile
            let activated = if created {
                !self.outbound.is_evicted()
            } else {
                self.sessions.mark_logged_in(self.key, self.outbound).await
            };
            if !activated {
                return Err(AppError::Replaced);
            }
            self.state = AuthState::LoggedIn;
            return Ok(created);
        }
    }

    /// First contact stores the credentials; later logins only compare
    async fn check(&self, credentials: &Credentials) -> Result<Verdict, AppError> {
        let record = self.sessions.create_if_absent(self.key).await;

        if !record.has_credentials() {
            match self
                .sessions
                .set_credentials(self.key, credentials, self.outbound)
                .await
            {
                Ok(()) => return Ok(Verdict::Created),
                Err(StoreError::UsernameTaken(name)) => {
                    return Ok(Verdict::Rejected(format!("Username '{}' is taken", name)));
                }
                // Another connection for this identity created the account first
                Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => {
                    let err = AppError::Persistence(e);
                    // The handshake is aborted either way
                    let _ = self
                        .outbound
                        .send(Envelope::failure(MessageCode::ServerError, ErrorInfo::from(&err)))
                        .await;
                    return Err(err);
                }
            }
        }

        if self.sessions.verify_credentials(self.key, credentials).await {
            Ok(Verdict::Matched)
        } else {
            Ok(Verdict::Rejected("Login details incorrect".to_string()))
        }
    }
}
