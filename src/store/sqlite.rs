//! SQLite store
//!
//! rusqlite is synchronous, so the connection sits behind a mutex and is only
//! reached through `Persistence`, which runs calls on the blocking pool.
//! Multi-statement mutations use a scoped `Transaction`: it rolls back on
//! drop unless `commit` was reached.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::store::{
    AccountRecord, AccountUpdate, ConversationMessage, FriendLink, RecentContent, Relations,
    RequestLink, Store,
};
use crate::types::{ApiKey, FriendshipId, Parties, RequestId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT NOT NULL PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    welcome_sent INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS friend_requests (
    id TEXT NOT NULL PRIMARY KEY,
    requester TEXT NOT NULL,
    addressee TEXT NOT NULL,
    FOREIGN KEY (requester) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (addressee) REFERENCES users(id) ON DELETE CASCADE,
    UNIQUE (requester, addressee)
);

CREATE TABLE IF NOT EXISTS friendships (
    id TEXT NOT NULL PRIMARY KEY,
    user1 TEXT NOT NULL,
    user2 TEXT NOT NULL,
    FOREIGN KEY (user1) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user2) REFERENCES users(id) ON DELETE CASCADE,
    UNIQUE (user1, user2)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    friendship_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    text TEXT NOT NULL,
    sent_at INTEGER NOT NULL,
    FOREIGN KEY (friendship_id) REFERENCES friendships(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_friendship ON messages(friendship_id, sent_at);
";

/// `Store` backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        // WAL for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("DB lock error: {}", e)))
    }
}

fn account_id_by_username(conn: &Connection, username: &str) -> Result<Option<ApiKey>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(ApiKey))
}

fn friendship_between(conn: &Connection, a: &ApiKey, b: &ApiKey) -> Result<Option<FriendshipId>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id FROM friendships
             WHERE (user1 = ?1 AND user2 = ?2) OR (user1 = ?2 AND user2 = ?1)",
            params![a.as_str(), b.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(FriendshipId))
}

fn request_parties(conn: &Connection, id: &RequestId) -> Result<Parties, StoreError> {
    conn.query_row(
        "SELECT requester, addressee FROM friend_requests WHERE id = ?1",
        params![id.0],
        |row| Ok(Parties::new(ApiKey(row.get(0)?), ApiKey(row.get(1)?))),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("friend request {}", id)))
}

fn relations(conn: &Connection, id: &ApiKey) -> Result<Relations, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT f.id, u.id, u.username FROM friendships f
         JOIN users u ON u.id = CASE WHEN f.user1 = ?1 THEN f.user2 ELSE f.user1 END
         WHERE f.user1 = ?1 OR f.user2 = ?1
         ORDER BY u.username",
    )?;
    let friends = stmt
        .query_map(params![id.as_str()], |row| {
            Ok(FriendLink {
                friendship_id: FriendshipId(row.get(0)?),
                friend: ApiKey(row.get(1)?),
                username: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT r.id, u.id, u.username, r.requester = ?1 FROM friend_requests r
         JOIN users u ON u.id = CASE WHEN r.requester = ?1 THEN r.addressee ELSE r.requester END
         WHERE r.requester = ?1 OR r.addressee = ?1
         ORDER BY u.username",
    )?;
    let requests = stmt
        .query_map(params![id.as_str()], |row| {
            Ok(RequestLink {
                request_id: RequestId(row.get(0)?),
                other: ApiKey(row.get(1)?),
                username: row.get(2)?,
                from_client: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Relations { friends, requests })
}

impl Store for SqliteStore {
    fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, username, password, welcome_sent FROM users")?;
        let accounts = stmt
            .query_map([], |row| {
                Ok(AccountRecord {
                    id: ApiKey(row.get(0)?),
                    username: row.get(1)?,
                    password: row.get(2)?,
                    welcome_sent: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn create_account(&self, id: &ApiKey, username: &str, password: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if account_id_by_username(&tx, username)?.is_some() {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::AlreadyExists(format!("account {}", id)));
        }

        tx.execute(
            "INSERT INTO users (id, username, password, welcome_sent) VALUES (?1, ?2, ?3, 0)",
            params![id.as_str(), username, password],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_account(&self, id: &ApiKey, update: &AccountUpdate) -> Result<(), StoreError> {
        let conn = self.lock()?;
        if let Some(welcome_sent) = update.welcome_sent {
            let changed = conn.execute(
                "UPDATE users SET welcome_sent = ?2 WHERE id = ?1",
                params![id.as_str(), welcome_sent],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("account {}", id)));
            }
        }
        Ok(())
    }

    fn find_usernames_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        // substr comparison keeps `%` and `_` in the prefix literal
        let mut stmt = conn.prepare(
            "SELECT username FROM users
             WHERE substr(username, 1, length(?1)) = ?1
             ORDER BY username",
        )?;
        let names = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn find_account_by_username(&self, username: &str) -> Result<Option<ApiKey>, StoreError> {
        let conn = self.lock()?;
        account_id_by_username(&conn, username)
    }

    fn create_friend_request(&self, from: &ApiKey, to_username: &str) -> Result<RequestId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let to = account_id_by_username(&tx, to_username)?
            .ok_or_else(|| StoreError::UnknownUser(to_username.to_string()))?;
        if &to == from {
            return Err(StoreError::SelfRequest);
        }
        if friendship_between(&tx, from, &to)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("already friends with {}", to_username)));
        }
        let pending: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM friend_requests
             WHERE (requester = ?1 AND addressee = ?2) OR (requester = ?2 AND addressee = ?1))",
            params![from.as_str(), to.as_str()],
            |row| row.get(0),
        )?;
        if pending {
            return Err(StoreError::AlreadyExists("friend request already exists".to_string()));
        }

        let id = RequestId::generate();
        tx.execute(
            "INSERT INTO friend_requests (id, requester, addressee) VALUES (?1, ?2, ?3)",
            params![id.0, from.as_str(), to.as_str()],
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn resolve_friend_request(&self, id: &RequestId) -> Result<Parties, StoreError> {
        let conn = self.lock()?;
        request_parties(&conn, id)
    }

    fn accept_friend_request(&self, id: &RequestId) -> Result<FriendshipId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let parties = request_parties(&tx, id)?;
        let friendship_id = FriendshipId::generate();
        tx.execute(
            "INSERT INTO friendships (id, user1, user2) VALUES (?1, ?2, ?3)",
            params![friendship_id.0, parties.first.as_str(), parties.second.as_str()],
        )?;
        tx.execute("DELETE FROM friend_requests WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(friendship_id)
    }

    fn reject_friend_request(&self, id: &RequestId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM friend_requests WHERE id = ?1", params![id.0])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("friend request {}", id)));
        }
        Ok(())
    }

    fn resolve_friendship(&self, id: &FriendshipId) -> Result<Parties, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user1, user2 FROM friendships WHERE id = ?1",
            params![id.0],
            |row| Ok(Parties::new(ApiKey(row.get(0)?), ApiKey(row.get(1)?))),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("friendship {}", id)))
    }

    fn find_friendship(&self, a: &ApiKey, b: &ApiKey) -> Result<Option<FriendshipId>, StoreError> {
        let conn = self.lock()?;
        friendship_between(&conn, a, b)
    }

    fn friends_of(&self, id: &ApiKey) -> Result<Vec<ApiKey>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT CASE WHEN user1 = ?1 THEN user2 ELSE user1 END FROM friendships
             WHERE user1 = ?1 OR user2 = ?1",
        )?;
        let friends = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))?
            .map(|r| r.map(ApiKey))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(friends)
    }

    fn append_message(
        &self,
        friendship: &FriendshipId,
        sender: &ApiKey,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (friendship_id, sender, text, sent_at) VALUES (?1, ?2, ?3, ?4)",
            params![friendship.0, sender.as_str(), text, sent_at.timestamp()],
        )?;
        Ok(())
    }

    fn load_relations(&self, id: &ApiKey) -> Result<Relations, StoreError> {
        let conn = self.lock()?;
        relations(&conn, id)
    }

    fn load_recent_content(&self, id: &ApiKey, since: DateTime<Utc>) -> Result<RecentContent, StoreError> {
        let conn = self.lock()?;
        let relations = relations(&conn, id)?;

        let mut stmt = conn.prepare(
            "SELECT m.friendship_id, m.sender, m.text, m.sent_at FROM messages m
             JOIN friendships f ON f.id = m.friendship_id
             WHERE (f.user1 = ?1 OR f.user2 = ?1) AND m.sent_at > ?2
             ORDER BY m.id",
        )?;
        let messages = stmt
            .query_map(params![id.as_str(), since.timestamp()], |row| {
                let secs: i64 = row.get(3)?;
                Ok(ConversationMessage {
                    friendship_id: FriendshipId(row.get(0)?),
                    sender: ApiKey(row.get(1)?),
                    text: row.get(2)?,
                    sent_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RecentContent { relations, messages })
    }
}
