//! In-process store
//!
//! Keeps every table in a single mutex-guarded struct, so each operation is
//! trivially atomic. Used when no database path is configured, and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::{
    AccountRecord, AccountUpdate, ConversationMessage, FriendLink, RecentContent, Relations,
    RequestLink, Store,
};
use crate::types::{ApiKey, FriendshipId, Parties, RequestId};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<ApiKey, AccountRecord>,
    requests: HashMap<RequestId, Parties>,
    friendships: HashMap<FriendshipId, Parties>,
    messages: Vec<ConversationMessage>,
}

impl Tables {
    fn username_of(&self, id: &ApiKey) -> String {
        self.accounts
            .get(id)
            .map(|a| a.username.clone())
            .unwrap_or_default()
    }

    fn friendship_between(&self, a: &ApiKey, b: &ApiKey) -> Option<FriendshipId> {
        self.friendships
            .iter()
            .find(|(_, p)| p.contains(a) && p.contains(b))
            .map(|(id, _)| id.clone())
    }

    fn relations(&self, id: &ApiKey) -> Relations {
        let mut friends: Vec<FriendLink> = self
            .friendships
            .iter()
            .filter_map(|(fid, parties)| {
                parties.other(id).map(|friend| FriendLink {
                    friendship_id: fid.clone(),
                    friend: friend.clone(),
                    username: self.username_of(friend),
                })
            })
            .collect();
        friends.sort_by(|a, b| a.username.cmp(&b.username));

        let mut requests: Vec<RequestLink> = self
            .requests
            .iter()
            .filter_map(|(rid, parties)| {
                parties.other(id).map(|other| RequestLink {
                    request_id: rid.clone(),
                    other: other.clone(),
                    username: self.username_of(other),
                    from_client: &parties.first == id,
                })
            })
            .collect();
        requests.sort_by(|a, b| a.username.cmp(&b.username));

        Relations { friends, requests }
    }
}

/// `Store` backed by in-memory maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call fail with `Unavailable` (test hook)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.lock()
    }
}

impl Store for MemoryStore {
    fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        Ok(self.lock()?.accounts.values().cloned().collect())
    }

    fn create_account(&self, id: &ApiKey, username: &str, password: &str) -> Result<(), StoreError> {
        let mut tables = self.lock_for_write()?;
        if tables.accounts.contains_key(id) {
            return Err(StoreError::AlreadyExists(format!("account {}", id)));
        }
        if tables.accounts.values().any(|a| a.username == username) {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }
        tables.accounts.insert(
            id.clone(),
            AccountRecord {
                id: id.clone(),
                username: username.to_string(),
                password: password.to_string(),
                welcome_sent: false,
            },
        );
        Ok(())
    }

    fn update_account(&self, id: &ApiKey, update: &AccountUpdate) -> Result<(), StoreError> {
        let mut tables = self.lock_for_write()?;
        let account = tables
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        if let Some(welcome_sent) = update.welcome_sent {
            account.welcome_sent = welcome_sent;
        }
        Ok(())
    }

    fn find_usernames_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.lock()?;
        let mut names: Vec<String> = tables
            .accounts
            .values()
            .filter(|a| a.username.starts_with(prefix))
            .map(|a| a.username.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn find_account_by_username(&self, username: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|a| a.username == username)
            .map(|a| a.id.clone()))
    }

    fn create_friend_request(&self, from: &ApiKey, to_username: &str) -> Result<RequestId, StoreError> {
        let mut tables = self.lock_for_write()?;
        let to = tables
            .accounts
            .values()
            .find(|a| a.username == to_username)
            .map(|a| a.id.clone())
            .ok_or_else(|| StoreError::UnknownUser(to_username.to_string()))?;

        if &to == from {
            return Err(StoreError::SelfRequest);
        }
        if tables.friendship_between(from, &to).is_some() {
            return Err(StoreError::AlreadyExists(format!("already friends with {}", to_username)));
        }
        if tables
            .requests
            .values()
            .any(|p| p.contains(from) && p.contains(&to))
        {
            return Err(StoreError::AlreadyExists("friend request already exists".to_string()));
        }

        let id = RequestId::generate();
        tables.requests.insert(id.clone(), Parties::new(from.clone(), to));
        Ok(id)
    }

    fn resolve_friend_request(&self, id: &RequestId) -> Result<Parties, StoreError> {
        self.lock()?
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("friend request {}", id)))
    }

    fn accept_friend_request(&self, id: &RequestId) -> Result<FriendshipId, StoreError> {
        let mut tables = self.lock_for_write()?;
        let parties = tables
            .requests
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("friend request {}", id)))?;
        let friendship_id = FriendshipId::generate();
        tables.friendships.insert(friendship_id.clone(), parties);
        Ok(friendship_id)
    }

    fn reject_friend_request(&self, id: &RequestId) -> Result<(), StoreError> {
        self.lock_for_write()?
            .requests
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("friend request {}", id)))
    }

    fn resolve_friendship(&self, id: &FriendshipId) -> Result<Parties, StoreError> {
        self.lock()?
            .friendships
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("friendship {}", id)))
    }

    fn find_friendship(&self, a: &ApiKey, b: &ApiKey) -> Result<Option<FriendshipId>, StoreError> {
        Ok(self.lock()?.friendship_between(a, b))
    }

    fn friends_of(&self, id: &ApiKey) -> Result<Vec<ApiKey>, StoreError> {
        Ok(self
            .lock()?
            .friendships
            .values()
            .filter_map(|p| p.other(id).cloned())
            .collect())
    }

    fn append_message(
        &self,
        friendship: &FriendshipId,
        sender: &ApiKey,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock_for_write()?;
        if !tables.friendships.contains_key(friendship) {
            return Err(StoreError::NotFound(format!("friendship {}", friendship)));
        }
        tables.messages.push(ConversationMessage {
            friendship_id: friendship.clone(),
            sender: sender.clone(),
            text: text.to_string(),
            sent_at,
        });
        Ok(())
    }

    fn load_relations(&self, id: &ApiKey) -> Result<Relations, StoreError> {
        Ok(self.lock()?.relations(id))
    }

    fn load_recent_content(&self, id: &ApiKey, since: DateTime<Utc>) -> Result<RecentContent, StoreError> {
        let tables = self.lock()?;
        let relations = tables.relations(id);
        let messages = tables
            .messages
            .iter()
            .filter(|m| m.sent_at > since)
            .filter(|m| {
                relations
                    .friends
                    .iter()
                    .any(|f| f.friendship_id == m.friendship_id)
            })
            .cloned()
            .collect();
        Ok(RecentContent { relations, messages })
    }
}
