//! Friend/Chat WebSocket Server - Entry Point
//!
//! Opens the store, hydrates the session registry, starts the broadcast
//! dispatcher and accepts connections.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use friend_chat_server::{open_store, serve, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=friend_chat_server=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("friend_chat_server=info")),
        )
        .init();

    let config = ServerConfig::parse();

    let store = open_store(&config)?;
    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Server listening on {}", config.addr);

    let (state, dispatcher) = AppState::new(store, config);
    state.sessions.hydrate().await?;

    tokio::spawn(async move {
        let stats = dispatcher.run().await;
        info!(?stats, "Dispatcher exited");
    });

    serve(listener, state).await;
    Ok(())
}
