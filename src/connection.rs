//! Connection manager
//!
//! Maps an identity to the live outbound handle of its connection. A handle
//! is the sending half of the connection's outbound queue; the connection's
//! writer task owns the WebSocket sink and drains that queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::SendError;
use crate::message::Envelope;
use crate::types::{ApiKey, ConnectionId};

/// Outbound side of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: mpsc::Sender<Envelope>,
    write_timeout: Duration,
    /// Set when a newer connection takes the binding
    eviction: Arc<Eviction>,
}

#[derive(Debug, Default)]
struct Eviction {
    evicted: AtomicBool,
    notify: Notify,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Envelope>, write_timeout: Duration) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
            write_timeout,
            eviction: Arc::new(Eviction::default()),
        }
    }

    /// Create a handle together with the queue the writer task drains
    pub fn channel(buffer: usize, write_timeout: Duration) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx, write_timeout), rx)
    }

    /// Queue an envelope for this connection
    ///
    /// Waits at most the write timeout for queue space.
    pub async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.sender
            .send_timeout(envelope, self.write_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::Timeout,
                SendTimeoutError::Closed(_) => SendError::ChannelClosed,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the writer task has stopped
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    /// Tell the owning connection to close
    pub fn evict(&self) {
        self.eviction.evicted.store(true, Ordering::SeqCst);
        self.eviction.notify.notify_waiters();
    }

    pub fn is_evicted(&self) -> bool {
        self.eviction.evicted.load(Ordering::SeqCst)
    }

    /// Resolves once this handle has been evicted, immediately if it already was
    pub async fn evicted(&self) {
        // Registered before the flag is read, so a concurrent `evict` is not missed
        let notified = self.eviction.notify.notified();
        if self.is_evicted() {
            return;
        }
        notified.await
    }
}

/// Identity → live connection table
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ApiKey, ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live handle, evicting any previous one for the same identity
    pub async fn bind(&self, key: &ApiKey, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.bind_with(key, handle, || async {}).await
    }

    /// Like `bind`, running `on_replace` when a previous handle was evicted
    ///
    /// The previous handle is flagged before `on_replace` runs, and the table
    /// stays locked until it finishes.
    pub async fn bind_with<F, Fut>(
        &self,
        key: &ApiKey,
        handle: ConnectionHandle,
        on_replace: F,
    ) -> Option<ConnectionHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut connections = self.connections.lock().await;
        let previous = connections.insert(key.clone(), handle);
        if let Some(previous) = &previous {
            debug!(key = %key, stale = %previous.id, "Evicting previous connection");
            previous.evict();
            on_replace().await;
        }
        previous
    }

    /// Remove the binding if it still belongs to `connection`
    ///
    /// Returns false when a newer connection has since taken over.
    pub async fn unbind(&self, key: &ApiKey, connection: ConnectionId) -> bool {
        self.release(key, connection, || async {}).await
    }

    /// Like `unbind`, running `on_release` before the binding is removed
    ///
    /// The table stays locked throughout, so a concurrent `bind` for the same
    /// identity lands after `on_release` has finished.
    pub async fn release<F, Fut>(&self, key: &ApiKey, connection: ConnectionId, on_release: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut connections = self.connections.lock().await;
        let owned = connections.get(key).is_some_and(|h| h.id == connection);
        if owned {
            on_release().await;
            connections.remove(key);
        }
        owned
    }

    #[cfg(test)]
    pub async fn is_bound_to(&self, key: &ApiKey, connection: ConnectionId) -> bool {
        self.connections
            .lock()
            .await
            .get(key)
            .is_some_and(|h| h.id == connection)
    }

    /// Clone of the bound handle
    pub async fn lookup(&self, key: &ApiKey) -> Option<ConnectionHandle> {
        self.connections.lock().await.get(key).cloned()
    }

    /// Deliver an envelope to the identity's live connection
    ///
    /// The table lock is released before the write.
    pub async fn send(&self, key: &ApiKey, envelope: Envelope) -> Result<(), SendError> {
        let handle = self.lookup(key).await.ok_or(SendError::NotConnected)?;
        handle.send(envelope).await
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
