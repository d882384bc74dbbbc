/// API request handlers

use super::responses::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tordht_core::{Context, DhtHost, EngineError, LookupError, ProvideError};
use tracing::{debug, error};

/// Providers returned when the query does not say
const DEFAULT_MAX_PROVIDERS: usize = 20;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<DhtHost>,
    /// Bound on a single provide or lookup
    pub operation_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct ProvidersQuery {
    pub max: Option<usize>,
}

/// Handler for GET /api/peer
pub async fn get_peer(State(state): State<AppState>) -> Json<PeerResponse> {
    debug!("API: GET /api/peer");

    let network = state.host.network();
    let listen_addrs = network
        .listen_addrs()
        .await
        .iter()
        .map(|addr| addr.to_string())
        .collect();

    Json(PeerResponse {
        peer_id: state.host.local_peer_id().to_hex(),
        endpoint: state.host.peer_info().map(|e| e.to_string()),
        listen_addrs,
        connected_peers: network.connected_peers().await.len(),
    })
}

/// Handler for POST /api/provide/:id
pub async fn provide(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProvideResponse>, AppError> {
    debug!("API: POST /api/provide/{}", id);

    let ctx = Context::with_timeout(state.operation_timeout);
    let key = state.host.provide(&ctx, &id).await?;

    Ok(Json(ProvideResponse {
        id,
        key: key.to_string(),
    }))
}

/// Handler for GET /api/providers/:id
pub async fn get_providers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProvidersQuery>,
) -> Result<Json<ProvidersResponse>, AppError> {
    debug!("API: GET /api/providers/{}", id);

    let max = query.max.unwrap_or(DEFAULT_MAX_PROVIDERS);
    if max == 0 {
        return Err(AppError::bad_request("max must be positive"));
    }

    let ctx = Context::with_timeout(state.operation_timeout);
    let found = state.host.find_providers(&ctx, &id, max).await?;

    Ok(Json(ProvidersResponse {
        key: tordht_core::ContentKey::from_id(&id).to_string(),
        id,
        providers: found.endpoints.iter().map(|e| e.to_string()).collect(),
        undecodable: found
            .undecodable
            .iter()
            .map(|u| UndecodableEntry {
                peer_id: u.peer_id.to_hex(),
                reason: u.reason.to_string(),
            })
            .collect(),
        partial: found.is_partial(),
    }))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
#[derive(Debug)]
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_status(message, StatusCode::BAD_REQUEST)
    }

    fn with_status(message: impl Into<String>, status_code: StatusCode) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(
            self.message,
            self.status_code.as_u16(),
        ));

        (self.status_code, body).into_response()
    }
}

impl From<ProvideError> for AppError {
    fn from(err: ProvideError) -> Self {
        let status = match &err.source {
            EngineError::NotListening => StatusCode::CONFLICT,
            EngineError::Interrupted(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::with_status(err.to_string(), status)
    }
}

impl From<LookupError> for AppError {
    fn from(err: LookupError) -> Self {
        let status = match &err {
            LookupError::Interrupted { .. } => StatusCode::GATEWAY_TIMEOUT,
            LookupError::Engine { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::with_status(err.to_string(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tordht_common::DhtConfig;
    use tordht_core::{KeyPair, MemoryNetwork};

    async fn state(memory: &MemoryNetwork, config: DhtConfig) -> AppState {
        let host = DhtHost::start(
            &Context::background(),
            Arc::new(memory.session()),
            KeyPair::generate(),
            config,
        )
        .await
        .unwrap();
        AppState {
            host: Arc::new(host),
            operation_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_provide_then_find() {
        let memory = MemoryNetwork::new();
        let state = state(&memory, DhtConfig::new()).await;

        let Json(provided) = provide(State(state.clone()), Path("x".to_string()))
            .await
            .unwrap();
        assert_eq!(provided.key, tordht_core::ContentKey::from_id("x").to_string());

        let Json(found) = get_providers(
            State(state.clone()),
            Path("x".to_string()),
            Query(ProvidersQuery { max: Some(5) }),
        )
        .await
        .unwrap();
        assert_eq!(found.key, provided.key);
        assert_eq!(found.providers, vec![state.host.peer_info().unwrap().to_string()]);
        assert!(!found.partial);

        let Json(peer) = get_peer(State(state.clone())).await;
        assert_eq!(peer.peer_id, state.host.local_peer_id().to_hex());
        assert_eq!(peer.listen_addrs.len(), 1);

        state.host.close().await;
    }

    #[tokio::test]
    async fn test_client_only_provide_conflict() {
        let memory = MemoryNetwork::new();
        let state = state(&memory, DhtConfig::new().client_only()).await;

        let err = provide(State(state.clone()), Path("x".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = get_providers(
            State(state.clone()),
            Path("x".to_string()),
            Query(ProvidersQuery { max: Some(0) }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let Json(peer) = get_peer(State(state.clone())).await;
        assert!(peer.endpoint.is_none());
    }
}
