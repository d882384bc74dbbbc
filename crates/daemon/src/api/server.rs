/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tordht_core::DhtHost;
use tower_http::cors::CorsLayer;
use tracing::info;

/// API Server exposing the host's peer information and provider operations
pub struct ApiServer {
    listen_addr: SocketAddr,
    host: Arc<DhtHost>,
    operation_timeout: Duration,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, host: Arc<DhtHost>, operation_timeout: Duration) -> Self {
        Self {
            listen_addr,
            host,
            operation_timeout,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            host: self.host.clone(),
            operation_timeout: self.operation_timeout,
        };

        Router::new()
            // Health check
            .route("/health", get(health_check))
            .route("/api/peer", get(get_peer))
            // Provider endpoints
            .route("/api/provide/:id", post(provide))
            .route("/api/providers/:id", get(get_providers))
            // Add CORS middleware
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        let app = self.router();

        info!("API server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
