//! HTTP surface over the dispatch facade.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Json, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{ErrorKind, OrchestratorError};
use crate::orchestrator::{DispatchOutcome, Dispatcher, Session, EVENT_BUS};
use crate::plugins::CapabilityListing;

pub struct ServerError(OrchestratorError);

impl ServerError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::DuplicateCapability | ErrorKind::InvalidState => {
                StatusCode::CONFLICT
            }
            ErrorKind::RevisionConflict | ErrorKind::ConcurrentModification => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StepBudgetExceeded => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ActivationError | ErrorKind::ProviderConfigError => StatusCode::BAD_GATEWAY,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::InvalidGraph
            | ErrorKind::RoutingDeadEnd
            | ErrorKind::CapabilityFailed
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        if let OrchestratorError::StepBudgetExceeded { output, .. } = &self.0 {
            body["output"] = json!(output);
        }
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ServerError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Deserialize)]
struct TurnRequest {
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    input: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/submit", post(submit))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/turns", post(post_turn))
        .route("/v1/capabilities", get(list_capabilities))
        .route("/v1/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(dispatcher: Arc<Dispatcher>, addr: &str) -> Result<()> {
    let app = router(AppState { dispatcher });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn post_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<DispatchOutcome>, ServerError> {
    let outcome = state.dispatcher.submit(&id, &request.input).await?;
    Ok(Json(outcome))
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<DispatchOutcome>, ServerError> {
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let outcome = state.dispatcher.submit(&session_id, &request.input).await?;
    Ok(Json(outcome))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Session>, ServerError> {
    Ok(Json(state.dispatcher.session(&id).await?))
}

async fn list_capabilities(State(state): State<AppState>) -> Json<Vec<CapabilityListing>> {
    Json(state.dispatcher.registry().list().await)
}

/// Streams dispatch events as JSON text frames.
async fn events(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(forward_events)
}

async fn forward_events(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = EVENT_BUS.subscribe();

    let forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event stream subscriber lagged by {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Inbound frames are ignored; a close or error ends the stream.
    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, WsMessage::Close(_)) {
            break;
        }
    }
    forward.abort();
}
