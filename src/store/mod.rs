//! Persistence collaborator
//!
//! `Store` is the narrow, synchronous CRUD surface the core consumes for
//! accounts, friend requests, friendships and message history. `Persistence`
//! is the async front used by the rest of the server: every call runs on the
//! blocking pool under a timeout and transient failures are retried a bounded
//! number of times.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StoreError;
use crate::types::{ApiKey, FriendshipId, Parties, RequestId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persisted account row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: ApiKey,
    pub username: String,
    pub password: String,
    pub welcome_sent: bool,
}

/// Partial account update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub welcome_sent: Option<bool>,
}

/// Friendship as seen from one party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendLink {
    pub friendship_id: FriendshipId,
    pub friend: ApiKey,
    pub username: String,
}

/// Pending request as seen from one party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLink {
    pub request_id: RequestId,
    pub other: ApiKey,
    pub username: String,
    /// True when the viewing party sent the request
    pub from_client: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relations {
    pub friends: Vec<FriendLink>,
    pub requests: Vec<RequestLink>,
}

/// Stored chat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub friendship_id: FriendshipId,
    pub sender: ApiKey,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentContent {
    pub relations: Relations,
    /// Oldest first
    pub messages: Vec<ConversationMessage>,
}

/// Backing store operations
///
/// Implementations must make each multi-row mutation atomic.
pub trait Store: Send + Sync + 'static {
    fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError>;

    /// Fails with `UsernameTaken` if another identity owns `username`
    fn create_account(&self, id: &ApiKey, username: &str, password: &str) -> Result<(), StoreError>;

    fn update_account(&self, id: &ApiKey, update: &AccountUpdate) -> Result<(), StoreError>;

    fn find_usernames_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn find_account_by_username(&self, username: &str) -> Result<Option<ApiKey>, StoreError>;

    /// Fails with `AlreadyExists` if the pair are friends or a request exists in either direction
    fn create_friend_request(&self, from: &ApiKey, to_username: &str) -> Result<RequestId, StoreError>;

    /// Returns requester first, addressee second
    fn resolve_friend_request(&self, id: &RequestId) -> Result<Parties, StoreError>;

    /// Inserts the friendship and deletes the request in one transaction
    fn accept_friend_request(&self, id: &RequestId) -> Result<FriendshipId, StoreError>;

    fn reject_friend_request(&self, id: &RequestId) -> Result<(), StoreError>;

    fn resolve_friendship(&self, id: &FriendshipId) -> Result<Parties, StoreError>;

    fn find_friendship(&self, a: &ApiKey, b: &ApiKey) -> Result<Option<FriendshipId>, StoreError>;

    fn friends_of(&self, id: &ApiKey) -> Result<Vec<ApiKey>, StoreError>;

    fn append_message(
        &self,
        friendship: &FriendshipId,
        sender: &ApiKey,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn load_relations(&self, id: &ApiKey) -> Result<Relations, StoreError>;

    /// Relations plus messages strictly newer than `since`
    fn load_recent_content(&self, id: &ApiKey, since: DateTime<Utc>) -> Result<RecentContent, StoreError>;
}

/// Timeout and retry bounds for store calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Async handle over a shared `Store`
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl Persistence {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Run one store call on the blocking pool, retrying transient failures
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: Fn(&dyn Store) -> Result<T, StoreError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt = 1;
        loop {
            let store = Arc::clone(&self.store);
            let f = f.clone();
            let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

            let result = match tokio::time::timeout(self.policy.timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(StoreError::Unavailable(format!("store task failed: {}", e))),
                Err(_) => Err(StoreError::Timeout),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    warn!(op, attempt, error = %e, "Store call failed, retrying");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        self.call("load_accounts", |s| s.load_accounts()).await
    }

    pub async fn create_account(&self, id: &ApiKey, username: &str, password: &str) -> Result<(), StoreError> {
        let (id, username, password) = (id.clone(), username.to_string(), password.to_string());
        self.call("create_account", move |s| s.create_account(&id, &username, &password))
            .await
    }

    pub async fn update_account(&self, id: &ApiKey, update: AccountUpdate) -> Result<(), StoreError> {
        let id = id.clone();
        self.call("update_account", move |s| s.update_account(&id, &update))
            .await
    }

    pub async fn find_usernames_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        self.call("find_usernames_by_prefix", move |s| s.find_usernames_by_prefix(&prefix))
            .await
    }

    pub async fn find_account_by_username(&self, username: &str) -> Result<Option<ApiKey>, StoreError> {
        let username = username.to_string();
        self.call("find_account_by_username", move |s| s.find_account_by_username(&username))
            .await
    }

    pub async fn create_friend_request(&self, from: &ApiKey, to_username: &str) -> Result<RequestId, StoreError> {
        let (from, to_username) = (from.clone(), to_username.to_string());
        self.call("create_friend_request", move |s| s.create_friend_request(&from, &to_username))
            .await
    }

    pub async fn resolve_friend_request(&self, id: &RequestId) -> Result<Parties, StoreError> {
        let id = id.clone();
        self.call("resolve_friend_request", move |s| s.resolve_friend_request(&id))
            .await
    }

    pub async fn accept_friend_request(&self, id: &RequestId) -> Result<FriendshipId, StoreError> {
        let id = id.clone();
        self.call("accept_friend_request", move |s| s.accept_friend_request(&id))
            .await
    }

    pub async fn reject_friend_request(&self, id: &RequestId) -> Result<(), StoreError> {
        let id = id.clone();
        self.call("reject_friend_request", move |s| s.reject_friend_request(&id))
            .await
    }

    pub async fn resolve_friendship(&self, id: &FriendshipId) -> Result<Parties, StoreError> {
        let id = id.clone();
        self.call("resolve_friendship", move |s| s.resolve_friendship(&id))
            .await
    }

    pub async fn find_friendship(&self, a: &ApiKey, b: &ApiKey) -> Result<Option<FriendshipId>, StoreError> {
        let (a, b) = (a.clone(), b.clone());
        self.call("find_friendship", move |s| s.find_friendship(&a, &b))
            .await
    }

    pub async fn friends_of(&self, id: &ApiKey) -> Result<Vec<ApiKey>, StoreError> {
        let id = id.clone();
        self.call("friends_of", move |s| s.friends_of(&id)).await
    }

    pub async fn append_message(
        &self,
        friendship: &FriendshipId,
        sender: &ApiKey,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (friendship, sender, text) = (friendship.clone(), sender.clone(), text.to_string());
        self.call("append_message", move |s| {
            s.append_message(&friendship, &sender, &text, sent_at)
        })
        .await
    }

    pub async fn load_relations(&self, id: &ApiKey) -> Result<Relations, StoreError> {
        let id = id.clone();
        self.call("load_relations", move |s| s.load_relations(&id)).await
    }

    pub async fn load_recent_content(&self, id: &ApiKey, since: DateTime<Utc>) -> Result<RecentContent, StoreError> {
        let id = id.clone();
        self.call("load_recent_content", move |s| s.load_recent_content(&id, since))
            .await
    }
}
