use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::{HeaderMap, HeaderName};
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vroom_core::{
    AuthGate, ParticipantId, Principal, SessionId, SessionRepository, SessionStateProvider,
};
use vroom_telemetry::MetricsRecorder;

use crate::auth::extract_credential;
use crate::config::{StreamSettings, VroomSettings};
use crate::error::ApiError;
use crate::registry::ConnectionRegistry;
use crate::stream::StreamHandler;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub stream: StreamSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9092,
            stream: StreamSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &VroomSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            stream: settings.stream.clone(),
        }
    }
}

/// Collaborators the server is wired with.
#[derive(Clone)]
pub struct ServerDeps {
    pub auth: Arc<dyn AuthGate>,
    pub sessions: Arc<dyn SessionRepository>,
    pub provider: Arc<dyn SessionStateProvider>,
    pub metrics: Arc<MetricsRecorder>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<dyn AuthGate>,
    pub sessions: Arc<dyn SessionRepository>,
    pub streams: Arc<StreamHandler>,
    pub metrics: Arc<MetricsRecorder>,
}

impl AppState {
    pub fn new(deps: ServerDeps, stream: &StreamSettings, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(stream.max_connections_per_session));
        let streams = StreamHandler::new(
            registry,
            deps.provider,
            Arc::clone(&deps.metrics),
            stream,
            shutdown,
        );
        Self {
            auth: deps.auth,
            sessions: deps.sessions,
            streams: Arc::new(streams),
            metrics: deps.metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.streams.registry()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/virtual-room/{session_id}", get(stream_handler))
        .route("/virtual-room/{session_id}/connections", get(connections_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start serving, and return a handle that can shut the server down.
pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let state = AppState::new(deps, &config.stream, shutdown.clone());
    let registry = Arc::clone(state.registry());

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        max_connections_per_session = config.stream.max_connections_per_session,
        heartbeat_ms = config.stream.heartbeat_interval_ms,
        refresh_ms = config.stream.refresh_interval_ms,
        "vroom server started"
    );

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Live connections across every session.
    pub fn connection_count(&self) -> usize {
        self.registry.total()
    }

    /// Close every live stream and wait for the listener to drain.
    pub async fn shutdown(self) {
        tracing::info!(connections = self.registry.total(), "shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task did not exit cleanly");
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    token: Option<String>,
    participant_id: Option<String>,
}

/// Authenticate before judging the rest of the query string, so a mangled
/// query without a usable credential is still a 401.
async fn authorize(
    state: &AppState,
    query: Result<Query<StreamQuery>, QueryRejection>,
    headers: &HeaderMap,
) -> Result<(Principal, StreamQuery), ApiError> {
    let (query, rejected) = match query {
        Ok(Query(query)) => (query, None),
        Err(rejection) => (StreamQuery::default(), Some(rejection)),
    };

    let credential = extract_credential(query.token.as_deref(), headers)?;
    let principal = state.auth.verify(&credential).await?;

    match rejected {
        Some(rejection) => Err(ApiError::BadQuery(rejection.body_text())),
        None => Ok((principal, query)),
    }
}

/// `GET /virtual-room/{session_id}`: authorize, confirm the session exists,
/// then hand the request over to an event stream.
async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (principal, query) = authorize(&state, query, &headers).await?;

    let session_id = SessionId::from_raw(session_id);
    if state.sessions.find_by_id(&session_id).await?.is_none() {
        return Err(ApiError::NotFound(session_id));
    }

    tracing::debug!(session_id = %session_id, subject = %principal.subject, "stream authorized");

    let participant_id = query
        .participant_id
        .filter(|p| !p.trim().is_empty())
        .map(ParticipantId::from_raw);
    let events = state
        .streams
        .open(session_id, participant_id)
        .map(|frame| Ok::<_, Infallible>(frame.into_event()));

    let headers = [
        (CACHE_CONTROL, "no-cache, no-transform"),
        (CONNECTION, "keep-alive"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(events)))
}

/// `GET /virtual-room/{session_id}/connections`: live connection count.
async fn connections_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, query, &headers).await?;

    let session_id = SessionId::from_raw(session_id);
    let connections = state.registry().count(&session_id);
    Ok(Json(serde_json::json!({
        "sessionId": session_id,
        "connections": connections,
    })))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry().total(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
