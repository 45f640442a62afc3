//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ApiKey`: opaque per-user identity supplied in the credential header
//! - `ConnectionId`: UUID-based identifier of one live transport
//! - `RequestId` / `FriendshipId`: 32-char hex record identifiers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identity (newtype pattern)
///
/// Opaque token that is the primary key of an account.
/// Stable for the lifetime of the account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(pub String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one live connection
///
/// Distinguishes a fresh connection from a stale one bound to the same
/// identity, so teardown of the old one never removes the new binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16 random bytes, hex encoded
fn random_hex_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pending friend request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepted friendship identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FriendshipId(pub String);

impl FriendshipId {
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

impl std::fmt::Display for FriendshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two identities attached to a friend request or friendship
///
/// For requests, `first` is always the requester and `second` the addressee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parties {
    pub first: ApiKey,
    pub second: ApiKey,
}

impl Parties {
    pub fn new(first: ApiKey, second: ApiKey) -> Self {
        Self { first, second }
    }

    pub fn contains(&self, key: &ApiKey) -> bool {
        &self.first == key || &self.second == key
    }

    /// The party that is not `key`, if `key` is one of the two
    pub fn other(&self, key: &ApiKey) -> Option<&ApiKey> {
        if &self.first == key {
            Some(&self.second)
        } else if &self.second == key {
            Some(&self.first)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiKey> {
        [&self.first, &self.second].into_iter()
    }
}
