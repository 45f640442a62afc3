//! Client content views
//!
//! Joins store rows (friendships, pending requests, message history) with
//! live presence from the session registry into the payloads clients render.

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Utc};

use crate::error::StoreError;
use crate::message::{format_timestamp, ChatMessage, Friend, FriendContent, PendingRequest, UserContent};
use crate::session::SessionRegistry;
use crate::store::{Persistence, Relations};
use crate::types::{ApiKey, FriendshipId};

async fn friends_and_requests(
    relations: &Relations,
    sessions: &SessionRegistry,
) -> (Vec<Friend>, Vec<PendingRequest>) {
    let mut friends = Vec::with_capacity(relations.friends.len());
    for link in &relations.friends {
        let (active, message) = match sessions.get(&link.friend).await {
            Some(record) => (record.active, record.status_message),
            None => (false, String::new()),
        };
        friends.push(Friend {
            username: link.username.clone(),
            active,
            message,
        });
    }

    let requests = relations
        .requests
        .iter()
        .map(|link| PendingRequest {
            username: link.username.clone(),
            request_id: link.request_id.clone(),
            from_client: link.from_client,
        })
        .collect();

    (friends, requests)
}

/// Full content for `key`: friends, pending requests and messages newer than `history`
pub async fn user_content(
    key: &ApiKey,
    persistence: &Persistence,
    sessions: &SessionRegistry,
    history: Duration,
) -> Result<UserContent, StoreError> {
    let since = Utc::now() - history;
    let recent = persistence.load_recent_content(key, since).await?;
    let (friends, friend_requests) = friends_and_requests(&recent.relations, sessions).await;

    let own_name = sessions.display_name(key).await.unwrap_or_default();
    let friend_names: HashMap<&FriendshipId, &str> = recent
        .relations
        .friends
        .iter()
        .map(|f| (&f.friendship_id, f.username.as_str()))
        .collect();

    // Every friend gets an entry, even without recent messages
    let mut messages: BTreeMap<String, Vec<ChatMessage>> = recent
        .relations
        .friends
        .iter()
        .map(|f| (f.username.clone(), Vec::new()))
        .collect();

    for stored in recent.messages {
        let Some(friend_name) = friend_names.get(&stored.friendship_id) else {
            continue;
        };
        let (sender, receiver) = if &stored.sender == key {
            (own_name.clone(), friend_name.to_string())
        } else {
            (friend_name.to_string(), own_name.clone())
        };
        messages
            .entry(friend_name.to_string())
            .or_default()
            .push(ChatMessage {
                text: stored.text,
                sender,
                receiver,
                date: format_timestamp(stored.sent_at),
            });
    }

    Ok(UserContent {
        friends,
        friend_requests,
        messages,
    })
}

/// Friends and pending requests for `key`
pub async fn friend_content(
    key: &ApiKey,
    persistence: &Persistence,
    sessions: &SessionRegistry,
) -> Result<FriendContent, StoreError> {
    let relations = persistence.load_relations(key).await?;
    let (friends, friend_requests) = friends_and_requests(&relations, sessions).await;
    Ok(FriendContent {
        friends,
        friend_requests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::connection::ConnectionHandle;
    use crate::message::Credentials;
    use crate::store::{MemoryStore, RetryPolicy, Store};

    async fn setup() -> (Arc<MemoryStore>, Persistence, SessionRegistry, ApiKey, ApiKey) {
        let store = Arc::new(MemoryStore::new());
        let persistence = Persistence::new(store.clone(), RetryPolicy::default());
        let sessions = SessionRegistry::new(persistence.clone());

        let alice = ApiKey::new("u1");
        let bob = ApiKey::new("u2");
        let (handle, _) = ConnectionHandle::channel(1, std::time::Duration::from_millis(10));
        for (key, name) in [(&alice, "alice"), (&bob, "bob")] {
            sessions.create_if_absent(key).await;
            sessions
                .set_credentials(key, &Credentials::new(name, "pw"), &handle)
                .await
                .unwrap();
        }
        sessions.mark_inactive(&bob).await;
        (store, persistence, sessions, alice, bob)
    }

    #[tokio::test]
    async fn test_user_content_joins_presence_and_messages() {
        let (store, persistence, sessions, alice, bob) = setup().await;
        let rid = store.create_friend_request(&alice, "bob").unwrap();
        let fid = store.accept_friend_request(&rid).unwrap();
        store.append_message(&fid, &alice, "hi bob", Utc::now()).unwrap();
        store.append_message(&fid, &bob, "hi alice", Utc::now()).unwrap();

        let content = user_content(&alice, &persistence, &sessions, Duration::days(3))
            .await
            .unwrap();

        assert_eq!(content.friends.len(), 1);
        assert_eq!(content.friends[0].username, "bob");
        assert!(!content.friends[0].active);
        assert!(content.friends[0].message.starts_with("Inactive since"));

        let thread = &content.messages["bob"];
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].sender, "alice");
        assert_eq!(thread[0].receiver, "bob");
        assert_eq!(thread[1].sender, "bob");
        assert_eq!(thread[1].receiver, "alice");
    }

    #[tokio::test]
    async fn test_friend_without_messages_has_empty_thread() {
        let (store, persistence, sessions, alice, _) = setup().await;
        let rid = store.create_friend_request(&alice, "bob").unwrap();
        store.accept_friend_request(&rid).unwrap();

        let content = user_content(&alice, &persistence, &sessions, Duration::days(3))
            .await
            .unwrap();
        assert_eq!(content.messages.get("bob"), Some(&Vec::new()));
    }

    #[tokio::test]
    async fn test_friend_content_lists_requests() {
        let (store, persistence, sessions, alice, bob) = setup().await;
        let rid = store.create_friend_request(&alice, "bob").unwrap();

        let content = friend_content(&bob, &persistence, &sessions).await.unwrap();
        assert!(content.friends.is_empty());
        assert_eq!(
            content.friend_requests,
            vec![PendingRequest {
                username: "alice".into(),
                request_id: rid,
                from_client: false,
            }]
        );
    }
}
