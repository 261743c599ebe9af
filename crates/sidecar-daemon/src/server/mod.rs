//! WebSocket server.
//!
//! One [`Session`](crate::session::Session) per WebSocket connection on
//! `/ws`; `/health` reports liveness and the connection count.

mod config;
mod connection;
mod credentials;
mod health;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::agent::AgentLoader;
use crate::oauth::{OAuthClient, OAuthError};
use crate::relay::RelayConfig;
use crate::shared::{CredentialEpoch, SharedConfig, WorkingDirectory};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to initialize OAuth client: {0}")]
    OAuth(#[from] OAuthError),
}

/// State shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub working_dir: WorkingDirectory,
    pub credentials: CredentialEpoch,
    pub loader: Arc<dyn AgentLoader>,
    pub relay: RelayConfig,
    pub oauth: OAuthClient,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        config: SharedConfig,
        working_dir: WorkingDirectory,
        loader: Arc<dyn AgentLoader>,
        relay: RelayConfig,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            config,
            working_dir,
            credentials: CredentialEpoch::new(),
            loader,
            relay,
            oauth: OAuthClient::new()?,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connection_closed(&self) -> usize {
        self.connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health_handler))
        .with_state(state)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    info!(%addr, "Sidecar server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("Sidecar server stopped");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}
