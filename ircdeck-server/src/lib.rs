//! ircdeck server: IRC connections on one side, live browser views on the
//! other.
//!
//! [`network::NetworkManager`] owns the IRC connections and implements the
//! core's backend interface; [`web`] streams rendered fragments to browsers
//! over SSE and accepts their commands.

pub mod config;
pub mod network;
pub mod web;

use std::sync::Arc;

use anyhow::{Context, Result};
use ircdeck_core::notify::NotificationQueue;
use ircdeck_core::stream::StreamCoordinator;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::network::NetworkManager;
use crate::web::AppState;

/// Run until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<()> {
    let queue = NotificationQueue::new(config.notification_capacity, config.enqueue_timeout());
    let manager = Arc::new(NetworkManager::new(queue.sender(), config.servers_path()));
    manager.restore();

    let shutdown = CancellationToken::new();
    let coordinator = Arc::new(StreamCoordinator::new(
        manager.clone(),
        queue,
        config.stream_config(),
        shutdown.clone(),
    ));
    let state = Arc::new(AppState::new(coordinator, config.push_timeout()));
    let app = web::router(state, config.web_static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!("HTTP listener on {}", config.listen_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            signal.cancel();
        })
        .await?;

    for network in manager.networks() {
        if let Err(e) = network.quit(Some("ircdeck shutting down")).await {
            tracing::debug!(server = %network.identity(), error = %e, "quit on shutdown failed");
        }
    }
    Ok(())
}
