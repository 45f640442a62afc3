use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use friend_chat_server::message::{
    ChatDraft, ChatMessage, Credentials, FriendContent, FriendDecision, FriendDecisionResult, FriendRequestForm,
    FriendRequestResult, OfflineNotice, SearchQuery, SearchResults, UserContent,
};
use friend_chat_server::{
    credential_header, serve, ApiKey, AppState, ClientRequest, Envelope, ErrorCode, MemoryStore, MessageCode,
    ServerConfig,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, Arc<AppState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ServerConfig {
        write_timeout_ms: 1000,
        ..ServerConfig::default()
    };
    let (state, dispatcher) = AppState::new(Arc::new(MemoryStore::new()), config);
    tokio::spawn(dispatcher.run());
    tokio::spawn(serve(listener, state.clone()));

    (addr, state)
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, key: &str) -> Self {
        let mut request = format!("ws://{}", addr).into_client_request().unwrap();
        let header = credential_header(&ApiKey::new(key), "secret");
        request
            .headers_mut()
            .insert(AUTHORIZATION, header.parse().unwrap());

        let (ws, _) = connect_async(request).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, request: ClientRequest) {
        let json = request.to_envelope().unwrap().to_json().unwrap();
        self.ws.send(Message::Text(json)).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return Envelope::from_json(&text).unwrap();
            }
        }
    }

    /// Skip envelopes until one with `code` arrives
    async fn recv_code(&mut self, code: MessageCode) -> Envelope {
        loop {
            let envelope = self.recv().await;
            if envelope.code == code {
                return envelope;
            }
        }
    }

    /// Run the handshake; returns the codes seen up to and including `AllContent`
    async fn login(&mut self, username: &str, password: &str) -> (Vec<MessageCode>, UserContent) {
        assert_eq!(self.recv().await.code, MessageCode::LoginRequired);
        self.send(ClientRequest::SubmitCredentials(Credentials::new(username, password)))
            .await;

        let mut codes = Vec::new();
        loop {
            let envelope = self.recv().await;
            codes.push(envelope.code);
            if envelope.code == MessageCode::AllContent {
                return (codes, envelope.decode().unwrap());
            }
        }
    }

    /// Next envelope if one arrives within `wait`
    async fn recv_within(&mut self, wait: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return Some(Envelope::from_json(&text).unwrap()),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Wait for the server to close the socket
    async fn expect_closed(&mut self) {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("connection still open");
            match frame {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
        while let Some(Ok(_)) = self.ws.next().await {}
    }
}

async fn wait_inactive(state: &AppState, key: &str) {
    let key = ApiKey::new(key);
    for _ in 0..100 {
        if !state.sessions.is_active(&key).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} still active", key);
}

/// Connect, log in, then disconnect
async fn register(addr: SocketAddr, state: &AppState, key: &str, username: &str) {
    let mut client = TestClient::connect(addr, key).await;
    client.login(username, "pw").await;
    client.close().await;
    wait_inactive(state, key).await;
}

#[tokio::test]
async fn test_welcome_only_on_first_login() {
    let (addr, state) = start_server().await;

    let mut client = TestClient::connect(addr, "u1").await;
    let (codes, content) = client.login("alice", "pw").await;
    assert_eq!(
        codes,
        vec![
            MessageCode::LoginAccepted,
            MessageCode::Welcome,
            MessageCode::AllContent
        ]
    );
    assert!(content.friends.is_empty());
    client.close().await;
    wait_inactive(&state, "u1").await;

    let mut client = TestClient::connect(addr, "u1").await;
    let (codes, _) = client.login("alice", "pw").await;
    assert_eq!(codes, vec![MessageCode::LoginAccepted, MessageCode::AllContent]);
    assert!(state.sessions.is_active(&ApiKey::new("u1")).await);
}

#[tokio::test]
async fn test_missing_header_is_refused() {
    let (addr, _state) = start_server().await;

    let err = connect_async(format!("ws://{}", addr)).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_wrong_credentials_can_be_retried() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u1", "alice").await;

    let mut client = TestClient::connect(addr, "u1").await;
    assert_eq!(client.recv().await.code, MessageCode::LoginRequired);

    client
        .send(ClientRequest::SubmitCredentials(Credentials::new("alice", "nope")))
        .await;
    assert_eq!(client.recv().await.code, MessageCode::LoginRejected);

    client
        .send(ClientRequest::SubmitCredentials(Credentials::new("", "")))
        .await;
    assert_eq!(client.recv().await.code, MessageCode::CredentialsRequired);

    client
        .send(ClientRequest::SubmitCredentials(Credentials::new("alice", "pw")))
        .await;
    assert_eq!(client.recv().await.code, MessageCode::LoginAccepted);
    assert_eq!(client.recv().await.code, MessageCode::AllContent);
}

#[tokio::test]
async fn test_friend_request_accept_and_chat() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u2", "bob").await;

    // Request to an inactive user still succeeds for the sender
    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;
    alice
        .send(ClientRequest::FriendRequest(FriendRequestForm {
            username: "bob".into(),
        }))
        .await;
    let result: FriendRequestResult = alice
        .recv_code(MessageCode::FriendRequestResult)
        .await
        .decode()
        .unwrap();
    assert!(result.ok);
    let request_id = result.request_id.unwrap();

    // Bob sees the pending request on login and accepts it
    let mut bob = TestClient::connect(addr, "u2").await;
    let (_, content) = bob.login("bob", "pw").await;
    assert_eq!(content.friend_requests.len(), 1);
    assert_eq!(content.friend_requests[0].username, "alice");
    assert!(!content.friend_requests[0].from_client);

    bob.send(ClientRequest::FriendDecision(FriendDecision {
        request_id: request_id.clone(),
        accept: true,
    }))
    .await;
    let decision: FriendDecisionResult = bob
        .recv_code(MessageCode::FriendAcceptResult)
        .await
        .decode()
        .unwrap();
    assert!(decision.ok);

    let update: FriendContent = bob
        .recv_code(MessageCode::FriendContentUpdate)
        .await
        .decode()
        .unwrap();
    assert_eq!(update.friends[0].username, "alice");
    assert!(update.friends[0].active);

    // Alice's first update is for her own request; wait for the one listing bob
    loop {
        let update: FriendContent = alice
            .recv_code(MessageCode::FriendContentUpdate)
            .await
            .decode()
            .unwrap();
        if !update.friends.is_empty() {
            assert_eq!(update.friends[0].username, "bob");
            assert!(update.friend_requests.is_empty());
            break;
        }
    }

    alice
        .send(ClientRequest::ChatSend(ChatDraft {
            receiver: "bob".into(),
            text: "hi bob".into(),
        }))
        .await;

    let echo: ChatMessage = alice
        .recv_code(MessageCode::ChatReceive)
        .await
        .decode()
        .unwrap();
    assert_eq!(echo.sender, "alice");
    assert_eq!(echo.receiver, "bob");

    let delivered: ChatMessage = bob
        .recv_code(MessageCode::ChatReceive)
        .await
        .decode()
        .unwrap();
    assert_eq!(delivered, echo);
}

#[tokio::test]
async fn test_chat_to_non_friend_fails() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u2", "bob").await;

    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;

    for receiver in ["bob", "nobody", ""] {
        alice
            .send(ClientRequest::ChatSend(ChatDraft {
                receiver: receiver.into(),
                text: "hello".into(),
            }))
            .await;
        let failure = alice.recv_code(MessageCode::DeliveryFailed).await;
        assert_eq!(failure.error.unwrap().code, ErrorCode::InvalidRequest);
    }
}

#[tokio::test]
async fn test_only_addressee_can_accept() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u2", "bob").await;

    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;
    alice
        .send(ClientRequest::FriendRequest(FriendRequestForm {
            username: "bob".into(),
        }))
        .await;
    let result: FriendRequestResult = alice
        .recv_code(MessageCode::FriendRequestResult)
        .await
        .decode()
        .unwrap();

    alice
        .send(ClientRequest::FriendDecision(FriendDecision {
            request_id: result.request_id.unwrap(),
            accept: true,
        }))
        .await;
    let envelope = alice.recv_code(MessageCode::FriendAcceptResult).await;
    assert_eq!(envelope.error.as_ref().unwrap().code, ErrorCode::InvalidRequest);
    assert!(!envelope.decode::<FriendDecisionResult>().unwrap().ok);

    // Duplicate request in the same direction is refused
    alice
        .send(ClientRequest::FriendRequest(FriendRequestForm {
            username: "bob".into(),
        }))
        .await;
    let result: FriendRequestResult = alice
        .recv_code(MessageCode::FriendRequestResult)
        .await
        .decode()
        .unwrap();
    assert!(!result.ok);
}

#[tokio::test]
async fn test_search_excludes_self() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u2", "alan").await;
    register(addr, &state, "u3", "bob").await;

    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;
    alice
        .send(ClientRequest::SearchUsers(SearchQuery { prefix: "al".into() }))
        .await;

    let results: SearchResults = alice
        .recv_code(MessageCode::SearchResults)
        .await
        .decode()
        .unwrap();
    assert_eq!(results.usernames, vec!["alan".to_string()]);
}

#[tokio::test]
async fn test_logout_notifies_friends() {
    let (addr, state) = start_server().await;
    register(addr, &state, "u2", "bob").await;

    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;
    alice
        .send(ClientRequest::FriendRequest(FriendRequestForm {
            username: "bob".into(),
        }))
        .await;
    let result: FriendRequestResult = alice
        .recv_code(MessageCode::FriendRequestResult)
        .await
        .decode()
        .unwrap();

    let mut bob = TestClient::connect(addr, "u2").await;
    bob.login("bob", "pw").await;
    bob.send(ClientRequest::FriendDecision(FriendDecision {
        request_id: result.request_id.unwrap(),
        accept: true,
    }))
    .await;
    bob.recv_code(MessageCode::FriendAcceptResult).await;

    alice.send(ClientRequest::Logout).await;
    alice.recv_code(MessageCode::LoggedOut).await;

    let notice: OfflineNotice = bob
        .recv_code(MessageCode::PresenceOffline)
        .await
        .decode()
        .unwrap();
    assert_eq!(notice.username, "alice");
    wait_inactive(&state, "u1").await;
}

#[tokio::test]
async fn test_second_connection_evicts_first() {
    let (addr, state) = start_server().await;

    let mut alice = TestClient::connect(addr, "u1").await;
    alice.login("alice", "pw").await;
    let mut bob = TestClient::connect(addr, "u2").await;
    bob.login("bob", "pw").await;

    alice
        .send(ClientRequest::FriendRequest(FriendRequestForm {
            username: "bob".into(),
        }))
        .await;
    let result: FriendRequestResult = alice
        .recv_code(MessageCode::FriendRequestResult)
        .await
        .decode()
        .unwrap();
    bob.send(ClientRequest::FriendDecision(FriendDecision {
        request_id: result.request_id.unwrap(),
        accept: true,
    }))
    .await;
    bob.recv_code(MessageCode::FriendAcceptResult).await;

    // A new connection for u1 that has not logged in yet
    let mut second = TestClient::connect(addr, "u1").await;
    assert_eq!(second.recv().await.code, MessageCode::LoginRequired);
    assert!(!state.sessions.is_active(&ApiKey::new("u1")).await);

    alice.recv_code(MessageCode::LoggedOut).await;
    alice.expect_closed().await;

    let notice: OfflineNotice = bob
        .recv_code(MessageCode::PresenceOffline)
        .await
        .decode()
        .unwrap();
    assert_eq!(notice.username, "alice");

    // Nothing reaches u1 until the new connection logs in
    bob.send(ClientRequest::ChatSend(ChatDraft {
        receiver: "alice".into(),
        text: "secret".into(),
    }))
    .await;
    bob.recv_code(MessageCode::ChatReceive).await;
    assert!(second.recv_within(Duration::from_millis(300)).await.is_none());

    second
        .send(ClientRequest::SubmitCredentials(Credentials::new("alice", "pw")))
        .await;
    assert_eq!(second.recv().await.code, MessageCode::LoginAccepted);
    let content: UserContent = second
        .recv_code(MessageCode::AllContent)
        .await
        .decode()
        .unwrap();
    assert_eq!(content.friends[0].username, "bob");
    assert_eq!(content.messages["bob"][0].text, "secret");
    assert!(state.sessions.is_active(&ApiKey::new("u1")).await);
}
