//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to the relay; this module provides router
//! construction, shared handler state, and server startup.

use std::sync::Arc;

use thiserror::Error;

use crate::relay::Relay;

pub mod connection;
pub mod http;
pub mod ws;

pub use connection::ConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listen port. The only fatal startup error.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// The relay core owning all session and channel state.
    pub relay: Arc<Relay>,
    /// Tracks live WebSocket connections.
    pub connections: Arc<ConnectionManager>,
    /// Shared bearer token for the admin surface.
    pub admin_token: String,
}

/// Binds `0.0.0.0:port` and serves the API until the process exits.
pub async fn start_server(state: AppState, port: u16) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://0.0.0.0:{}", port);

    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
