//! HTTP control surface for buildd.
//!
//! Local-only REST endpoints for starting, stopping and inspecting runs,
//! an SSE event stream for read-only observers, and a WebSocket channel that
//! streams events and accepts follow-up messages.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use build_core::events::Event;
use build_core::{ProjectId, Run};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::controller::{Controller, ControllerError, FilesView, RunStatusView};
use crate::publisher::Subscription;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/projects/{id}/runs", post(start_run))
        .route("/projects/{id}/status", get(get_status))
        .route("/projects/{id}/stop", post(stop_run))
        .route("/projects/{id}/files", get(list_files))
        .route("/projects/{id}/files/{*path}", get(read_file))
        .route("/projects/{id}/download", get(download_project))
        .route("/projects/{id}/session", delete(release_session))
        .route("/projects/{id}/events", get(stream_events))
        .route("/ws/{id}", get(ws_upgrade))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on 127.0.0.1 and serve until `shutdown` resolves.
pub async fn start_server(
    controller: Arc<Controller>,
    port: u16,
    auth_token: Option<String>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        controller,
        auth_token,
    });
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn status_for(error: &ControllerError) -> StatusCode {
    match error {
        ControllerError::EmptyRequest
        | ControllerError::Backend(BackendError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
        ControllerError::RunAlreadyActive(_) => StatusCode::CONFLICT,
        ControllerError::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControllerError::ProjectNotFound(_)
        | ControllerError::RunNotFound(_)
        | ControllerError::FileNotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::Storage(_)
        | ControllerError::Backend(_)
        | ControllerError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: &ControllerError) -> ApiError {
    let status = status_for(error);
    if status.is_server_error() {
        warn!(error = %error, "request failed");
    }
    error_response(status, error.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /projects/{id}/runs.
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub request: String,
}

/// Response for POST /projects/{id}/runs.
#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<Run>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for GET /projects/{id}/files/{*path}.
#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub path: String,
    pub content: String,
}

/// Query params for the event streams.
#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    /// First sequence number to replay.
    #[serde(default)]
    pub from: Option<u64>,
}

/// Client-to-server WebSocket frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message { text: String },
}

/// Server-to-client replies to client frames. Events are sent as bare envelopes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Accepted { run: Box<Run> },
    Error { error: String },
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /projects/{id}/runs - Start a run.
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);

    match state.controller.start(&project_id, &req.request).await {
        Ok(run) => {
            info!(project_id = %project_id, run_id = %run.id, "run accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(StartRunResponse {
                    accepted: true,
                    run: Some(run),
                    error: None,
                }),
            ))
        }
        Err(e) => Ok((
            status_for(&e),
            Json(StartRunResponse {
                accepted: false,
                run: None,
                error: Some(e.to_string()),
            }),
        )),
    }
}

/// GET /projects/{id}/status - Current stage and status.
async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunStatusView>, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    state
        .controller
        .status(&project_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// POST /projects/{id}/stop - Cancel the active run.
async fn stop_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    state
        .controller
        .stop(&project_id)
        .map_err(|e| api_error(&e))?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /projects/{id}/files - File listing.
async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<FilesView>, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    state
        .controller
        .files(&project_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// GET /projects/{id}/files/{*path} - One file's content.
async fn read_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, path)): Path<(String, String)>,
) -> Result<Json<FileResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    let content = state
        .controller
        .file(&project_id, &path)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(FileResponse { path, content }))
}

/// GET /projects/{id}/download - All project files as a ZIP archive.
async fn download_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    let bytes = state
        .controller
        .download(&project_id)
        .await
        .map_err(|e| api_error(&e))?;
    let disposition = format!("attachment; filename=\"{project_id}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// DELETE /projects/{id}/session - Release the project's session.
async fn release_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    state
        .controller
        .release_session(&project_id)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// First sequence to replay: `?from=`, else one past `Last-Event-ID`, else
/// the current run's `run-started` event.
async fn replay_from(
    state: &AppState,
    project_id: &ProjectId,
    query: &EventsQuery,
    headers: &HeaderMap,
) -> u64 {
    if let Some(from) = query.from {
        return from;
    }
    let resumed = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match resumed {
        Some(last) => last + 1,
        None => {
            state
                .controller
                .publisher()
                .current_run_start(project_id)
                .await
        }
    }
}

fn sse_event(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default()
        .event(event.kind.as_str())
        .id(event.sequence.to_string())
        .data(data)
}

/// GET /projects/{id}/events - Stream events (SSE).
///
/// Replays buffered events from the requested sequence, then streams live
/// events. The stream ends after a terminal event or when another subscriber
/// attaches.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    let from = replay_from(&state, &project_id, &query, &headers).await;
    let sub = state.controller.publisher().attach(&project_id, from).await;
    debug!(project_id = %project_id, from, "sse subscriber attached");

    let stream = stream::unfold((sub, false), |(mut sub, done): (Subscription, bool)| async move {
        if done {
            return None;
        }
        let event = sub.next().await?;
        let terminal = event.kind.is_terminal();
        Some((Ok::<_, Infallible>(sse_event(&event)), (sub, terminal)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /ws/{id} - Bidirectional event channel.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = ProjectId::from_string(&id);
    let from = replay_from(&state, &project_id, &query, &headers).await;
    Ok(ws.on_upgrade(move |socket| ws_session(socket, state, project_id, from)))
}

async fn ws_session(mut socket: WebSocket, state: Arc<AppState>, project_id: ProjectId, from: u64) {
    let mut sub = state.controller.publisher().attach(&project_id, from).await;
    info!(project_id = %project_id, from, "websocket subscriber attached");

    loop {
        tokio::select! {
            event = sub.next() => {
                let Some(event) = event else {
                    debug!(project_id = %project_id, "subscriber replaced, closing websocket");
                    break;
                };
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&state, &project_id, text.as_str()).await;
                        let Ok(reply) = serde_json::to_string(&reply) else {
                            continue;
                        };
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    // The run keeps going; its events stay buffered for the next subscriber.
    debug!(project_id = %project_id, "websocket closed");
}

/// Act on one client frame.
///
/// A follow-up message starts a new run once the current one is terminal. A
/// message sent while a run is active is answered with an error, not queued.
pub async fn handle_client_message(
    state: &AppState,
    project_id: &ProjectId,
    text: &str,
) -> ServerReply {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return ServerReply::Error {
                error: format!("invalid message: {e}"),
            };
        }
    };
    match message {
        ClientMessage::Message { text } => match state.controller.message(project_id, &text).await {
            Ok(run) => ServerReply::Accepted { run: Box::new(run) },
            Err(e) => ServerReply::Error {
                error: e.to_string(),
            },
        },
    }
}
