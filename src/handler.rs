//! WebSocket connection lifecycle
//!
//! `Connecting → Handshaking → Active → Closed`. The upgrade request names the
//! identity; the handshake then gates the steady-state loop, which processes
//! one request at a time and replies to the requester directly. Side effects
//! on other users go to the broadcast dispatcher as events. Teardown runs on
//! every exit path and is the only place a binding is removed.

use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::auth::{parse_credential_header, Handshake};
use crate::broadcast::BroadcastEvent;
use crate::connection::ConnectionHandle;
use crate::content::user_content;
use crate::error::{AppError, StoreError};
use crate::message::{
    format_timestamp, ChatDraft, ChatMessage, ClientRequest, Envelope, ErrorInfo, FriendDecision,
    FriendDecisionResult, FriendRequestForm, FriendRequestResult, MessageCode, Payload, SearchQuery,
    SearchResults,
};
use crate::server::AppState;
use crate::types::{ApiKey, FriendshipId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Handle a new TCP connection
///
/// Performs the WebSocket upgrade (refused with 401 when the credential
/// header is unusable), then runs the connection until it closes.
pub async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut identity = None;
    let check_header = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let header = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        match parse_credential_header(header) {
            Ok(key) => {
                identity = Some(key);
                Ok(response)
            }
            Err(e) => {
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_header).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!("Upgrade from {} refused: {}", peer_addr, e);
            return Err(e.into());
        }
    };
    let key = identity.ok_or_else(|| AppError::Protocol("missing Authorization header".into()))?;
    info!(key = %key, "Connected from {}", peer_addr);

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (handle, outbound_rx) =
        ConnectionHandle::channel(state.config.outbound_buffer.max(1), state.config.write_timeout());
    let writer = spawn_writer(ws_sender, outbound_rx, &state);
    let mut inbound = envelope_stream(ws_receiver);

    state.sessions.create_if_absent(&key).await;
    state
        .connections
        .bind_with(&key, handle.clone(), || state.sessions.mark_inactive(&key))
        .await;

    let connection = Connection {
        key: key.clone(),
        handle,
        state: state.clone(),
    };
    let (logged_in, result) = connection.run(&mut inbound).await;
    connection.teardown(logged_in).await;
    drop(connection);

    // Let queued replies (e.g. LoggedOut) flush before the socket closes
    if tokio::time::timeout(state.config.write_timeout(), writer).await.is_err() {
        debug!(key = %key, "Writer did not finish in time");
    }
    info!(key = %key, "Disconnected");

    match result {
        Ok(()) | Err(AppError::Disconnected) | Err(AppError::Replaced) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Writer task: drains the outbound queue into the socket
///
/// Stops when every handle is dropped or a write fails; the receiver is
/// dropped with it, which the read loop observes through the handle.
fn spawn_writer(
    mut ws_sender: WsSink,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    state: &AppState,
) -> JoinHandle<()> {
    let write_timeout = state.config.write_timeout();

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize envelope: {}", e);
                    continue;
                }
            };

            match tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(json))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("WebSocket send failed, ending write task: {}", e);
                    break;
                }
                Err(_) => {
                    warn!("WebSocket write timed out, ending write task");
                    break;
                }
            }
        }

        let _ = ws_sender.close().await;
    })
}

/// Decode text frames into envelopes
///
/// A close frame ends the exchange as `Disconnected`; control and binary
/// frames are skipped.
fn envelope_stream<S>(frames: S) -> impl Stream<Item = Result<Envelope, AppError>> + Unpin
where
    S: Stream<Item = Result<Message, WsError>>,
{
    Box::pin(frames.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(
                Envelope::from_json(&text).map_err(|e| AppError::Protocol(format!("unparseable envelope: {}", e))),
            ),
            Ok(Message::Close(_)) => Some(Err(AppError::Disconnected)),
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(AppError::WebSocket(e))),
        }
    }))
}

enum Flow {
    Continue,
    Close,
}

/// One authenticated (or authenticating) connection
struct Connection {
    key: ApiKey,
    handle: ConnectionHandle,
    state: Arc<AppState>,
}

impl Connection {
    /// Handshake, initial sync, then the steady-state loop
    ///
    /// Returns whether the handshake succeeded along with the exit reason.
    async fn run<S>(&self, inbound: &mut S) -> (bool, Result<(), AppError>)
    where
        S: Stream<Item = Result<Envelope, AppError>> + Unpin,
    {
        let mut handshake = Handshake::new(&self.key, &self.state.sessions, &self.handle);
        let outcome = tokio::select! {
            outcome = handshake.run(inbound) => outcome,
            _ = self.handle.evicted() => Err(AppError::Replaced),
        };
        match outcome {
            Ok(outcome) => debug!(
                key = %self.key,
                attempts = outcome.attempts,
                created = outcome.account_created,
                "Handshake complete"
            ),
            Err(e) => return (false, Err(e)),
        }

        if let Err(e) = self.sync_content().await {
            return (true, Err(e));
        }
        self.state
            .emit(BroadcastEvent::UserLoggedIn { key: self.key.clone() })
            .await;

        (true, self.serve(inbound).await)
    }

    async fn serve<S>(&self, inbound: &mut S) -> Result<(), AppError>
    where
        S: Stream<Item = Result<Envelope, AppError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = inbound.next() => frame,
                _ = self.handle.closed() => return Err(AppError::Disconnected),
                _ = self.handle.evicted() => {
                    info!(key = %self.key, "Replaced by a newer connection");
                    self.reply(Ok(Envelope::notice(
                        MessageCode::LoggedOut,
                        "Logged in from another connection",
                    )))
                    .await;
                    return Err(AppError::Replaced);
                }
            };
            let envelope = match frame {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => return Err(e),
                None => return Err(AppError::Disconnected),
            };

            let request = match ClientRequest::from_envelope(&envelope) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!(key = %self.key, code = ?envelope.code, "Ignoring unexpected message");
                    continue;
                }
                Err(e @ AppError::TypeMismatch { .. }) => {
                    error!(key = %self.key, error = %e, "Dropping message");
                    continue;
                }
                Err(e) => {
                    return Err(AppError::Protocol(format!(
                        "malformed {:?} payload: {}",
                        envelope.code, e
                    )))
                }
            };

            debug!(key = %self.key, code = ?request.code(), "Request");
            if let Flow::Close = self.handle_request(request).await {
                return Ok(());
            }
        }
    }

    async fn handle_request(&self, request: ClientRequest) -> Flow {
        match request {
            ClientRequest::SearchUsers(query) => self.search(query).await,
            ClientRequest::FriendRequest(form) => self.friend_request(form).await,
            ClientRequest::FriendDecision(decision) => self.friend_decision(decision).await,
            ClientRequest::ChatSend(draft) => self.chat(draft).await,
            ClientRequest::SubmitCredentials(_) => {
                debug!(key = %self.key, "Already logged in, ignoring credentials");
            }
            ClientRequest::Logout => {
                info!(key = %self.key, "Logout requested");
                self.reply(Ok(Envelope::notice(MessageCode::LoggedOut, "Logged out")))
                    .await;
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// Send `AllContent`; a load failure is reported but not fatal
    async fn sync_content(&self) -> Result<(), AppError> {
        let state = &self.state;
        let envelope = match user_content(&self.key, &state.persistence, &state.sessions, state.config.history()).await {
            Ok(content) => Envelope::with_payload("All content", &content)?,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to load content");
                Envelope::failure(MessageCode::ServerError, ErrorInfo::from(&AppError::Persistence(e)))
            }
        };
        self.handle.send(envelope).await?;
        Ok(())
    }

    async fn search(&self, query: SearchQuery) {
        let own_name = self.state.sessions.display_name(&self.key).await.unwrap_or_default();
        let envelope = match self.state.persistence.find_usernames_by_prefix(&query.prefix).await {
            Ok(mut usernames) => {
                usernames.retain(|name| *name != own_name);
                Envelope::with_payload("Search results", &SearchResults { usernames })
            }
            Err(e) => Ok(Envelope::failure(
                MessageCode::SearchResults,
                ErrorInfo::from(&AppError::Persistence(e)),
            )),
        };
        self.reply(envelope).await;
    }

    async fn friend_request(&self, form: FriendRequestForm) {
        match self
            .state
            .persistence
            .create_friend_request(&self.key, &form.username)
            .await
        {
            Ok(request_id) => {
                info!(key = %self.key, to = %form.username, "Friend request created");
                let result = FriendRequestResult {
                    ok: true,
                    detail: format!("Friend request sent to {}", form.username),
                    request_id: Some(request_id.clone()),
                };
                self.reply(Envelope::with_payload("Friend request sent", &result)).await;
                self.state
                    .emit(BroadcastEvent::FriendRequestChanged {
                        request_id,
                        parties: None,
                    })
                    .await;
            }
            Err(e) => {
                let err = AppError::Persistence(e);
                let result = FriendRequestResult {
                    ok: false,
                    detail: err.to_string(),
                    request_id: None,
                };
                self.reply(refusal(&result, &err)).await;
            }
        }
    }

    async fn friend_decision(&self, decision: FriendDecision) {
        match self.decide(&decision).await {
            Ok((detail, friendship_id, event)) => {
                let result = FriendDecisionResult {
                    ok: true,
                    detail: detail.to_string(),
                    friendship_id,
                };
                self.reply(Envelope::with_payload(detail, &result)).await;
                self.state.emit(event).await;
            }
            Err(e) => {
                let result = FriendDecisionResult {
                    ok: false,
                    detail: e.to_string(),
                    friendship_id: None,
                };
                self.reply(refusal(&result, &e)).await;
            }
        }
    }

    async fn decide(
        &self,
        decision: &FriendDecision,
    ) -> Result<(&'static str, Option<FriendshipId>, BroadcastEvent), AppError> {
        let persistence = &self.state.persistence;
        let request_id = &decision.request_id;

        let parties = persistence.resolve_friend_request(request_id).await?;
        if parties.second != self.key {
            return Err(AppError::InvalidRequest(
                "only the addressee can answer a friend request".into(),
            ));
        }

        if decision.accept {
            let friendship_id = persistence.accept_friend_request(request_id).await?;
            info!(key = %self.key, friendship = %friendship_id, "Friend request accepted");
            Ok((
                "Friend request accepted",
                Some(friendship_id.clone()),
                BroadcastEvent::FriendshipChanged { friendship_id },
            ))
        } else {
            persistence.reject_friend_request(request_id).await?;
            info!(key = %self.key, request = %request_id, "Friend request rejected");
            Ok((
                "Friend request rejected",
                None,
                BroadcastEvent::FriendRequestChanged {
                    request_id: request_id.clone(),
                    parties: Some(parties),
                },
            ))
        }
    }

    async fn chat(&self, draft: ChatDraft) {
        match self.store_chat(draft).await {
            Ok((friendship_id, message)) => {
                self.reply(Envelope::with_payload("Message sent", &message)).await;
                self.state
                    .emit(BroadcastEvent::ChatDelivered {
                        friendship_id,
                        sender: self.key.clone(),
                        message,
                    })
                    .await;
            }
            Err(e) => {
                debug!(key = %self.key, error = %e, "Chat refused");
                self.reply(Ok(Envelope::failure(MessageCode::DeliveryFailed, ErrorInfo::from(&e))))
                    .await;
            }
        }
    }

    async fn store_chat(&self, draft: ChatDraft) -> Result<(FriendshipId, ChatMessage), AppError> {
        if draft.receiver.is_empty() || draft.text.is_empty() {
            return Err(AppError::InvalidRequest("receiver and text are required".into()));
        }
        let persistence = &self.state.persistence;

        let receiver = persistence
            .find_account_by_username(&draft.receiver)
            .await?
            .ok_or_else(|| StoreError::UnknownUser(draft.receiver.clone()))?;
        let friendship_id = persistence
            .find_friendship(&self.key, &receiver)
            .await?
            .ok_or_else(|| AppError::InvalidRequest(format!("{} is not a friend", draft.receiver)))?;

        let sent_at = Utc::now();
        persistence
            .append_message(&friendship_id, &self.key, &draft.text, sent_at)
            .await?;

        let sender = self.state.sessions.display_name(&self.key).await.unwrap_or_default();
        Ok((
            friendship_id,
            ChatMessage {
                text: draft.text,
                sender,
                receiver: draft.receiver,
                date: format_timestamp(sent_at),
            },
        ))
    }

    /// Replies to the requester are best effort
    async fn reply(&self, envelope: Result<Envelope, AppError>) {
        let sent = match envelope {
            Ok(envelope) => self.handle.send(envelope).await.map_err(AppError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(key = %self.key, error = %e, "Reply dropped");
        }
    }

    /// The single teardown path
    ///
    /// Only the connection that still owns the binding clears `active`, so a
    /// replaced connection closing late cannot log out its successor. An
    /// evicted connection was already marked inactive by the new `bind`, but
    /// still owes its friends the offline notice.
    async fn teardown(&self, logged_in: bool) {
        let sessions = &self.state.sessions;
        let released = self
            .state
            .connections
            .release(&self.key, self.handle.id, || sessions.mark_inactive(&self.key))
            .await;

        if !released && !self.handle.is_evicted() {
            debug!(key = %self.key, "Binding already replaced");
            return;
        }
        if logged_in {
            let username = sessions.display_name(&self.key).await.unwrap_or_default();
            self.state
                .emit(BroadcastEvent::UserLoggedOut {
                    key: self.key.clone(),
                    username,
                })
                .await;
        }
    }
}

/// Result payload carrying the error that caused it
fn refusal<P: Payload>(payload: &P, err: &AppError) -> Result<Envelope, AppError> {
    let mut envelope = Envelope::with_payload(err.to_string(), payload)?;
    envelope.error = Some(ErrorInfo::from(err));
    Ok(envelope)
}
