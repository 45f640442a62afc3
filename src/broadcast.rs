//! Broadcast Dispatcher
//!
//! Single consumer of the events read loops emit when an action affects other
//! users. Recipients are resolved through the store before any send starts;
//! each recipient then gets its own delivery task so a slow or closed peer
//! never holds up the others. Deliveries to the same recipient are chained,
//! so they arrive in the order their events were emitted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::content::friend_content;
use crate::error::{AppError, StoreError};
use crate::message::{ChatMessage, Envelope, OfflineNotice, OnlineNotice};
use crate::session::SessionRegistry;
use crate::store::Persistence;
use crate::types::{ApiKey, FriendshipId, Parties, RequestId};

/// Internal notification of a multi-party side effect
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// Identity finished its handshake
    UserLoggedIn { key: ApiKey },
    /// Identity's connection closed
    UserLoggedOut { key: ApiKey, username: String },
    /// A friend request was created or rejected
    ///
    /// `parties` is set when the request row no longer exists.
    FriendRequestChanged {
        request_id: RequestId,
        parties: Option<Parties>,
    },
    /// A friend request was accepted
    FriendshipChanged { friendship_id: FriendshipId },
    /// A chat message was stored
    ChatDelivered {
        friendship_id: FriendshipId,
        sender: ApiKey,
        message: ChatMessage,
    },
}

/// Counters reported when the dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    /// Recipient was inactive or had no live connection
    pub skipped: u64,
    pub failed: u64,
    /// Events whose recipients could not be resolved
    pub dropped: u64,
}

/// What a recipient receives
#[derive(Debug, Clone)]
enum Notice {
    Fixed(Envelope),
    /// Built per recipient from its own relations
    FriendContent,
}

#[derive(Debug)]
enum Delivery {
    Delivered,
    Skipped,
    Failed,
}

/// Shared handles every delivery task needs
#[derive(Clone)]
struct Deliverer {
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    persistence: Persistence,
}

impl Deliverer {
    async fn deliver(&self, recipient: ApiKey, notice: Notice) -> Delivery {
        // Look up before the activity check: a handle bound after an eviction
        // is only seen once `active` has been cleared for it
        let Some(handle) = self.connections.lookup(&recipient).await else {
            return Delivery::Skipped;
        };
        if !self.sessions.is_active(&recipient).await {
            debug!(key = %recipient, "Recipient inactive, skipping");
            return Delivery::Skipped;
        }

        let envelope = match notice {
            Notice::Fixed(envelope) => envelope,
            Notice::FriendContent => {
                let built = friend_content(&recipient, &self.persistence, &self.sessions)
                    .await
                    .map_err(AppError::from)
                    .and_then(|content| Envelope::with_payload("Friend content updated", &content));
                match built {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(key = %recipient, error = %e, "Failed to build friend content");
                        return Delivery::Failed;
                    }
                }
            }
        };

        match handle.send(envelope).await {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                warn!(key = %recipient, error = %e, "Broadcast delivery failed");
                Delivery::Failed
            }
        }
    }
}

/// Consumes `BroadcastEvent`s and fans them out to live connections
pub struct Dispatcher {
    receiver: mpsc::Receiver<BroadcastEvent>,
    deliverer: Deliverer,
    deliveries: JoinSet<(ApiKey, Delivery)>,
    permits: Arc<Semaphore>,
    /// Completion signal of the latest delivery queued per recipient
    lanes: HashMap<ApiKey, oneshot::Receiver<()>>,
    stats: DispatchStats,
}

impl Dispatcher {
    /// `max_deliveries` bounds how many sends run at once
    pub fn new(
        receiver: mpsc::Receiver<BroadcastEvent>,
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionManager>,
        persistence: Persistence,
        max_deliveries: usize,
    ) -> Self {
        Self {
            receiver,
            deliverer: Deliverer {
                sessions,
                connections,
                persistence,
            },
            deliveries: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_deliveries.max(1))),
            lanes: HashMap::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Run until every event sender is dropped and in-flight deliveries finish
    pub async fn run(mut self) -> DispatchStats {
        info!("Broadcast dispatcher started");

        loop {
            tokio::select! {
                event = self.receiver.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                Some(joined) = self.deliveries.join_next(), if !self.deliveries.is_empty() => {
                    self.record(joined);
                }
            }
        }

        while let Some(joined) = self.deliveries.join_next().await {
            self.record(joined);
        }

        info!(
            delivered = self.stats.delivered,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            dropped = self.stats.dropped,
            "Broadcast dispatcher stopped"
        );
        self.stats
    }

    async fn dispatch(&mut self, event: BroadcastEvent) {
        debug!(?event, "Dispatching event");

        let (recipients, notice) = match self.resolve(event).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "Dropping broadcast event");
                self.stats.dropped += 1;
                return;
            }
        };

        for recipient in recipients {
            let deliverer = self.deliverer.clone();
            let permits = self.permits.clone();
            let notice = notice.clone();
            let (done, next) = oneshot::channel();
            let previous = self.lanes.insert(recipient.clone(), next);

            self.deliveries.spawn(async move {
                // Wait for the earlier delivery to this recipient, success or not
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let delivery = match permits.acquire_owned().await {
                    Ok(_permit) => deliverer.deliver(recipient.clone(), notice).await,
                    Err(_) => Delivery::Failed,
                };
                let _ = done.send(());
                (recipient, delivery)
            });
        }
    }

    /// Compute the affected identities and what they receive
    async fn resolve(&self, event: BroadcastEvent) -> Result<(Vec<ApiKey>, Notice), AppError> {
        let persistence = &self.deliverer.persistence;

        match event {
            BroadcastEvent::UserLoggedIn { key } => {
                let username = self
                    .deliverer
                    .sessions
                    .display_name(&key)
                    .await
                    .ok_or_else(|| StoreError::NotFound(format!("session {}", key)))?;
                let friends = persistence.friends_of(&key).await?;
                let envelope = Envelope::with_payload(
                    format!("{} is online", username),
                    &OnlineNotice { username },
                )?;
                Ok((friends, Notice::Fixed(envelope)))
            }
            BroadcastEvent::UserLoggedOut { key, username } => {
                let friends = persistence.friends_of(&key).await?;
                let envelope = Envelope::with_payload(
                    format!("{} is offline", username),
                    &OfflineNotice { username },
                )?;
                Ok((friends, Notice::Fixed(envelope)))
            }
            BroadcastEvent::FriendRequestChanged { request_id, parties } => {
                let parties = match parties {
                    Some(parties) => parties,
                    None => persistence.resolve_friend_request(&request_id).await?,
                };
                Ok((parties.iter().cloned().collect(), Notice::FriendContent))
            }
            BroadcastEvent::FriendshipChanged { friendship_id } => {
                let parties = persistence.resolve_friendship(&friendship_id).await?;
                Ok((parties.iter().cloned().collect(), Notice::FriendContent))
            }
            BroadcastEvent::ChatDelivered {
                friendship_id,
                sender,
                message,
            } => {
                let parties = persistence.resolve_friendship(&friendship_id).await?;
                let receiver = parties.other(&sender).cloned().ok_or_else(|| {
                    StoreError::NotFound(format!("{} in friendship {}", sender, friendship_id))
                })?;
                let envelope = Envelope::with_payload("New message", &message)?;
                Ok((vec![receiver], Notice::Fixed(envelope)))
            }
        }
    }

    fn record(&mut self, joined: Result<(ApiKey, Delivery), JoinError>) {
        match joined {
            Ok((recipient, delivery)) => {
                match delivery {
                    Delivery::Delivered => self.stats.delivered += 1,
                    Delivery::Skipped => self.stats.skipped += 1,
                    Delivery::Failed => self.stats.failed += 1,
                }
                // Keep the lane only while a later delivery is still queued
                if let Some(lane) = self.lanes.get_mut(&recipient) {
                    if !matches!(lane.try_recv(), Err(TryRecvError::Empty)) {
                        self.lanes.remove(&recipient);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Delivery task panicked");
                self.stats.failed += 1;
                self.lanes
                    .retain(|_, lane| matches!(lane.try_recv(), Err(TryRecvError::Empty)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::connection::ConnectionHandle;
    use crate::message::{Credentials, FriendContent, MessageCode};
    use crate::store::{MemoryStore, RetryPolicy, Store};

    const TIMEOUT: Duration = Duration::from_millis(50);

    struct Fixture {
        store: Arc<MemoryStore>,
        persistence: Persistence,
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let persistence = Persistence::new(store.clone(), RetryPolicy::default());
            Self {
                sessions: Arc::new(SessionRegistry::new(persistence.clone())),
                connections: Arc::new(ConnectionManager::new()),
                store,
                persistence,
            }
        }

        async fn account(&self, key: &str, name: &str) -> ApiKey {
            let key = ApiKey::new(key);
            let (handle, _) = ConnectionHandle::channel(1, TIMEOUT);
            self.sessions.create_if_absent(&key).await;
            self.sessions
                .set_credentials(&key, &Credentials::new(name, "pw"), &handle)
                .await
                .unwrap();
            key
        }

        /// Logged-in account with a bound connection
        async fn online(&self, key: &str, name: &str) -> (ApiKey, mpsc::Receiver<Envelope>) {
            let key = self.account(key, name).await;
            let (handle, rx) = ConnectionHandle::channel(16, TIMEOUT);
            self.connections.bind(&key, handle).await;
            (key, rx)
        }

        async fn offline(&self, key: &str, name: &str) -> ApiKey {
            let key = self.account(key, name).await;
            self.sessions.mark_inactive(&key).await;
            key
        }

        async fn run(&self, events: Vec<BroadcastEvent>) -> DispatchStats {
            let (tx, rx) = mpsc::channel(16);
            let dispatcher = Dispatcher::new(
                rx,
                self.sessions.clone(),
                self.connections.clone(),
                self.persistence.clone(),
                4,
            );
            for event in events {
                tx.send(event).await.unwrap();
            }
            drop(tx);
            dispatcher.run().await
        }
    }

    fn chat(sender: &str, receiver: &str, text: &str) -> ChatMessage {
        ChatMessage {
            text: text.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            date: "2024-01-01 10:00".into(),
        }
    }

    #[tokio::test]
    async fn test_chat_delivered_to_active_receiver_only() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.online("u1", "alice").await;
        let (bob, mut bob_rx) = fx.online("u2", "bob").await;
        let rid = fx.store.create_friend_request(&alice, "bob").unwrap();
        let fid = fx.store.accept_friend_request(&rid).unwrap();

        let stats = fx
            .run(vec![BroadcastEvent::ChatDelivered {
                friendship_id: fid.clone(),
                sender: alice.clone(),
                message: chat("alice", "bob", "hi"),
            }])
            .await;

        assert_eq!(stats.delivered, 1);
        let envelope = bob_rx.try_recv().unwrap();
        assert_eq!(envelope.code, MessageCode::ChatReceive);
        assert_eq!(envelope.decode::<ChatMessage>().unwrap().text, "hi");
        assert!(alice_rx.try_recv().is_err());

        // Receiver goes offline: skipped, nothing queued
        fx.sessions.mark_inactive(&bob).await;
        let stats = fx
            .run(vec![BroadcastEvent::ChatDelivered {
                friendship_id: fid,
                sender: alice,
                message: chat("alice", "bob", "still there?"),
            }])
            .await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.skipped, 1);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_friendship_changed_updates_both_parties() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.online("u1", "alice").await;
        let (_bob, mut bob_rx) = fx.online("u2", "bob").await;
        let rid = fx.store.create_friend_request(&alice, "bob").unwrap();
        let fid = fx.store.accept_friend_request(&rid).unwrap();

        let stats = fx
            .run(vec![BroadcastEvent::FriendshipChanged { friendship_id: fid }])
            .await;
        assert_eq!(stats.delivered, 2);

        let update: FriendContent = alice_rx.try_recv().unwrap().decode().unwrap();
        assert_eq!(update.friends[0].username, "bob");
        assert!(update.friends[0].active);

        let update: FriendContent = bob_rx.try_recv().unwrap().decode().unwrap();
        assert_eq!(update.friends[0].username, "alice");
    }

    #[tokio::test]
    async fn test_request_to_inactive_user_is_skipped() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.online("u1", "alice").await;
        fx.offline("u2", "bob").await;
        let rid = fx.store.create_friend_request(&alice, "bob").unwrap();

        let stats = fx
            .run(vec![BroadcastEvent::FriendRequestChanged {
                request_id: rid.clone(),
                parties: None,
            }])
            .await;

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.skipped, 1);
        let update: FriendContent = alice_rx.try_recv().unwrap().decode().unwrap();
        assert_eq!(update.friend_requests[0].request_id, rid);
        assert!(update.friend_requests[0].from_client);
    }

    #[tokio::test]
    async fn test_unresolvable_event_is_dropped() {
        let fx = Fixture::new();
        let stats = fx
            .run(vec![
                BroadcastEvent::FriendshipChanged {
                    friendship_id: FriendshipId("missing".into()),
                },
                BroadcastEvent::FriendRequestChanged {
                    request_id: RequestId("missing".into()),
                    parties: None,
                },
            ])
            .await;
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.online("u1", "alice").await;
        let (bob, bob_rx) = fx.online("u2", "bob").await;
        let (carol, mut carol_rx) = fx.online("u3", "carol").await;
        for name in ["bob", "carol"] {
            let rid = fx.store.create_friend_request(&alice, name).unwrap();
            fx.store.accept_friend_request(&rid).unwrap();
        }
        // Bob's writer is gone but his session still reads as active
        drop(bob_rx);
        assert!(fx.sessions.is_active(&bob).await);

        let stats = fx
            .run(vec![BroadcastEvent::UserLoggedIn { key: alice }])
            .await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);

        let envelope = carol_rx.try_recv().unwrap();
        assert_eq!(envelope.code, MessageCode::PresenceOnline);
        assert_eq!(envelope.decode::<OnlineNotice>().unwrap().username, "alice");
        assert!(fx.sessions.is_active(&carol).await);
    }

    #[tokio::test]
    async fn test_messages_to_one_recipient_keep_order() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.online("u1", "alice").await;
        let (_bob, mut bob_rx) = fx.online("u2", "bob").await;
        let rid = fx.store.create_friend_request(&alice, "bob").unwrap();
        let fid = fx.store.accept_friend_request(&rid).unwrap();

        let texts: Vec<String> = (0..12).map(|i| format!("message {}", i)).collect();
        let events = texts
            .iter()
            .map(|text| BroadcastEvent::ChatDelivered {
                friendship_id: fid.clone(),
                sender: alice.clone(),
                message: chat("alice", "bob", text),
            })
            .collect();

        let stats = fx.run(events).await;
        assert_eq!(stats.delivered, 12);

        let mut received = Vec::new();
        while let Ok(envelope) = bob_rx.try_recv() {
            received.push(envelope.decode::<ChatMessage>().unwrap().text);
        }
        assert_eq!(received, texts);
    }

    #[tokio::test]
    async fn test_logout_presence() {
        let fx = Fixture::new();
        let (alice, _) = fx.online("u1", "alice").await;
        let (_bob, mut bob_rx) = fx.online("u2", "bob").await;
        let rid = fx.store.create_friend_request(&alice, "bob").unwrap();
        fx.store.accept_friend_request(&rid).unwrap();

        let stats = fx
            .run(vec![BroadcastEvent::UserLoggedOut {
                key: alice,
                username: "alice".into(),
            }])
            .await;
        assert_eq!(stats.delivered, 1);

        let envelope = bob_rx.try_recv().unwrap();
        assert_eq!(envelope.code, MessageCode::PresenceOffline);
        assert_eq!(envelope.decode::<OfflineNotice>().unwrap().username, "alice");
    }
}
