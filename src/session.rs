//! Session registry
//!
//! Authoritative in-memory record of every known identity and its
//! login/activity state. The map is guarded by one `RwLock`; each record has
//! its own `Mutex`, so registry-wide reads never wait on a record mutation
//! and mutations of one record (including their store write) are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::error::StoreError;
use crate::message::Credentials;
use crate::store::{AccountRecord, AccountUpdate, Persistence};
use crate::types::ApiKey;

/// Login/activity state for one identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    /// Empty until the first successful login
    pub credentials: Credentials,
    pub display_name: String,
    pub account_created: bool,
    pub logged_in: bool,
    pub active: bool,
    pub welcome_sent: bool,
    /// Last transition, for display only
    pub status_message: String,
}

impl SessionRecord {
    fn from_account(account: AccountRecord) -> Self {
        Self {
            display_name: account.username.clone(),
            credentials: Credentials::new(account.username, account.password),
            account_created: true,
            welcome_sent: account.welcome_sent,
            ..Self::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.username.is_empty()
    }

    fn activate(&mut self) {
        self.logged_in = true;
        if !self.active {
            self.active = true;
            self.status_message = format!("Active since {}", Utc::now().format("%Y-%m-%d %H:%M"));
        }
    }

    fn deactivate(&mut self) {
        self.logged_in = false;
        if self.active {
            self.active = false;
            self.status_message = format!("Inactive since {}", Utc::now().format("%Y-%m-%d %H:%M"));
        }
    }
}

type SharedRecord = Arc<Mutex<SessionRecord>>;

/// Registry of session records keyed by identity
pub struct SessionRegistry {
    records: RwLock<HashMap<ApiKey, SharedRecord>>,
    persistence: Persistence,
}

impl SessionRegistry {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    /// Load persisted accounts as logged-out records
    ///
    /// Returns the number of records loaded.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let accounts = self.persistence.load_accounts().await?;
        let count = accounts.len();

        let mut records = self.records.write().await;
        for account in accounts {
            records
                .entry(account.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionRecord::from_account(account))));
        }

        info!("Session registry hydrated with {} accounts", count);
        Ok(count)
    }

    async fn record(&self, key: &ApiKey) -> Option<SharedRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Snapshot of one record
    pub async fn get(&self, key: &ApiKey) -> Option<SessionRecord> {
        let record = self.record(key).await?;
        let snapshot = record.lock().await.clone();
        Some(snapshot)
    }

    /// Return the record for `key`, creating an empty one on first contact
    pub async fn create_if_absent(&self, key: &ApiKey) -> SessionRecord {
        let record = {
            let mut records = self.records.write().await;
            records
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(key = %key, "New session record");
                    Arc::new(Mutex::new(SessionRecord::default()))
                })
                .clone()
        };
        let snapshot = record.lock().await.clone();
        snapshot
    }

    /// Persist first-login credentials and activate the session for `connection`
    ///
    /// Credentials are set once; a second call fails with `AlreadyExists`.
    /// An evicted `connection` creates the account but leaves it inactive.
    pub async fn set_credentials(
        &self,
        key: &ApiKey,
        credentials: &Credentials,
        connection: &ConnectionHandle,
    ) -> Result<(), StoreError> {
        let record = self
            .record(key)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("session {}", key)))?;

        let mut record = record.lock().await;
        if record.account_created || record.has_credentials() {
            return Err(StoreError::AlreadyExists(format!("credentials for {}", key)));
        }

        self.persistence
            .create_account(key, &credentials.username, &credentials.password)
            .await?;

        record.credentials = credentials.clone();
        record.display_name = credentials.username.clone();
        record.account_created = true;
        if !connection.is_evicted() {
            record.activate();
        }

        info!(key = %key, username = %credentials.username, "Account created");
        Ok(())
    }

    /// Compare submitted credentials with the stored ones
    pub async fn verify_credentials(&self, key: &ApiKey, credentials: &Credentials) -> bool {
        let Some(record) = self.record(key).await else {
            return false;
        };
        let record = record.lock().await;
        record.has_credentials() && record.credentials == *credentials
    }

    /// Activate the session on behalf of `connection`
    ///
    /// Refused once `connection` has been evicted. The check runs under the
    /// record lock, so it cannot undo the deactivation done on eviction.
    pub async fn mark_logged_in(&self, key: &ApiKey, connection: &ConnectionHandle) -> bool {
        let Some(record) = self.record(key).await else {
            return false;
        };
        let mut record = record.lock().await;
        if connection.is_evicted() {
            debug!(key = %key, "Evicted connection cannot activate session");
            return false;
        }
        record.activate();
        debug!(key = %key, "Session active");
        true
    }

    /// Clear `active` and `logged_in`
    pub async fn mark_inactive(&self, key: &ApiKey) {
        if let Some(record) = self.record(key).await {
            record.lock().await.deactivate();
            debug!(key = %key, "Session inactive");
        }
    }

    /// Claim the one-time welcome for `key`
    ///
    /// Returns true for exactly one caller; the flag is set in memory before
    /// the welcome is sent so concurrent logins cannot both send it.
    pub async fn claim_welcome(&self, key: &ApiKey) -> bool {
        let Some(record) = self.record(key).await else {
            return false;
        };
        let mut record = record.lock().await;
        let claimed = !record.welcome_sent;
        record.welcome_sent = true;
        claimed
    }

    /// Persist the welcome flag claimed by `claim_welcome`
    pub async fn persist_welcome_sent(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.persistence
            .update_account(
                key,
                AccountUpdate {
                    welcome_sent: Some(true),
                },
            )
            .await
    }

    pub async fn is_active(&self, key: &ApiKey) -> bool {
        let Some(record) = self.record(key).await else {
            return false;
        };
        let active = record.lock().await.active;
        active
    }

    pub async fn display_name(&self, key: &ApiKey) -> Option<String> {
        let record = self.record(key).await?;
        let name = record.lock().await.display_name.clone();
        Some(name)
    }

    /// Display names of every logged-in identity
    #[cfg(test)]
    pub async fn logged_in_users(&self) -> Vec<String> {
        // Copy the handles out so no record lock is taken under the map lock
        let snapshot: Vec<SharedRecord> = self.records.read().await.values().cloned().collect();

        let mut names = Vec::new();
        for record in snapshot {
            let record = record.lock().await;
            if record.logged_in {
                names.push(record.display_name.clone());
            }
        }
        names.sort();
        names
    }
}
