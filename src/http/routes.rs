use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::telemetry::{ChannelPhase, PerformanceSnapshot};
use crate::visualizer::VisualizerEvent;

use super::sse;

/// Shared application state for HTTP handlers.
#[derive(Clone)]
pub struct DebugHttpState {
    snapshots: watch::Receiver<Option<PerformanceSnapshot>>,
    events: broadcast::Sender<VisualizerEvent>,
    started: Instant,
    token: Arc<String>,
}

impl DebugHttpState {
    pub fn new(
        snapshots: watch::Receiver<Option<PerformanceSnapshot>>,
        events: broadcast::Sender<VisualizerEvent>,
        token: String,
    ) -> Self {
        Self {
            snapshots,
            events,
            started: Instant::now(),
            token: Arc::new(token),
        }
    }

    fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(), HttpServerError> {
        let provided = extract_token(headers, query_token);
        match provided {
            Some(value) if value == *self.token => Ok(()),
            _ => Err(HttpServerError::Unauthorized),
        }
    }

    fn latest(&self) -> Option<PerformanceSnapshot> {
        self.snapshots.borrow().clone()
    }

    fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Query payload for extracting token from URL.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
}

/// HTTP error variants mapped to JSON responses.
#[derive(Debug)]
pub enum HttpServerError {
    Unauthorized,
}

impl IntoResponse for HttpServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid token"),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Health endpoint response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u64,
    /// Whether a performance report has been published yet.
    pub reporting: bool,
}

/// Status endpoint response payload.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_ms: u64,
    pub midi_connected: bool,
    pub phase: Option<ChannelPhase>,
    pub active_keys: usize,
    pub snapshot: Option<PerformanceSnapshot>,
}

/// Build the Axum router with all handlers.
pub fn build_router(state: DebugHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/events", get(event_stream_handler))
        .with_state(state)
}

/// Run the HTTP server loop.
pub async fn run_http_server(state: DebugHttpState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding debug HTTP listener")?;
    let router = build_router(state);
    axum::serve(listener, router)
        .await
        .context("serving debug HTTP router")?;
    Ok(())
}

pub async fn health(
    State(state): State<DebugHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    Ok(Json(HealthResponse {
        status: "ok",
        uptime_ms: state.uptime_ms(),
        reporting: state.snapshots.borrow().is_some(),
    }))
}

pub async fn status(
    State(state): State<DebugHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    let snapshot = state.latest();
    Ok(Json(StatusResponse {
        uptime_ms: state.uptime_ms(),
        midi_connected: snapshot
            .as_ref()
            .map(|snapshot| snapshot.connection.connected)
            .unwrap_or(false),
        phase: snapshot.as_ref().map(|snapshot| snapshot.connection.phase),
        active_keys: snapshot
            .as_ref()
            .map(|snapshot| snapshot.active_keys)
            .unwrap_or(0),
        snapshot,
    }))
}

pub async fn event_stream_handler(
    State(state): State<DebugHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<sse::EventStream, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;
    Ok(sse::visualizer_events(state.events.subscribe()))
}

fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        return Some(token.to_string());
    }

    static X_DEBUG_TOKEN: HeaderName = HeaderName::from_static("x-debug-token");

    headers
        .get(&X_DEBUG_TOKEN)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| raw.strip_prefix("Bearer ").map(|v| v.to_string()))
        })
}
