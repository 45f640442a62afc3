//! Shared server state and the accept loop
//!
//! The session registry and connection manager are owned here and handed to
//! every connection task and to the broadcast dispatcher by reference.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastEvent, Dispatcher};
use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::error::{AppError, StoreError};
use crate::handler::handle_connection;
use crate::session::SessionRegistry;
use crate::store::{MemoryStore, Persistence, SqliteStore, Store};

/// State shared by every connection task
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub persistence: Persistence,
    pub events: mpsc::Sender<BroadcastEvent>,
    pub config: ServerConfig,
}

impl AppState {
    /// Build the shared state and the dispatcher that consumes its events
    pub fn new(store: Arc<dyn Store>, config: ServerConfig) -> (Arc<Self>, Dispatcher) {
        let persistence = Persistence::new(store, config.retry_policy());
        let sessions = Arc::new(SessionRegistry::new(persistence.clone()));
        let connections = Arc::new(ConnectionManager::new());
        let (events, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let dispatcher = Dispatcher::new(
            event_rx,
            sessions.clone(),
            connections.clone(),
            persistence.clone(),
            config.max_deliveries,
        );

        let state = Arc::new(Self {
            sessions,
            connections,
            persistence,
            events,
            config,
        });
        (state, dispatcher)
    }

    /// Hand an event to the dispatcher
    pub async fn emit(&self, event: BroadcastEvent) {
        if self.events.send(event).await.is_err() {
            error!("{}", AppError::ChannelSend);
        }
    }
}

/// Open the configured store: SQLite when a path is set, in-memory otherwise
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>, StoreError> {
    match &config.database {
        Some(path) => {
            info!("Using SQLite store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        None => {
            warn!("No database configured, state will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("Connection handler error for {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
