//! HTTP server
//!
//! Routes, handlers and server lifecycle. All `/api` routes sit behind the
//! auth middleware and, in HQ mode, behind the session-routing middleware
//! that forwards remote-owned session requests verbatim. The `/buffers`
//! WebSocket upgrade authenticates in its handler instead.

use crate::auth::AuthSettings;
use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use crate::fs_api;
use crate::hq::{proxy, HqAnnouncer, RegisterRemote, RemoteRegistry};
use crate::live::{ws, Broadcaster, LiveEvent};
use crate::session::{self, CreateSession, SessionListEntry, SessionManager, SessionStatus};
use crate::term::BufferCache;
use axum::{
    extract::{Path as AxumPath, Query, Request, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

/// Shared state behind every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub manager: Arc<SessionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub buffers: Arc<BufferCache>,
    /// Present only in HQ mode.
    pub registry: Option<Arc<RemoteRegistry>>,
    pub proxy_client: reqwest::Client,
    pub auth: AuthSettings,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/cleanup", delete(cleanup_session))
        .route("/api/cleanup-exited", post(cleanup_exited))
        .route("/api/sessions/:id/input", post(post_input))
        .route("/api/sessions/:id/resize", post(post_resize))
        .route("/api/sessions/:id/stream", get(stream_session))
        .route("/api/sessions/:id/snapshot", get(get_snapshot))
        .route("/api/sessions/:id/buffer", get(get_buffer))
        .route("/api/sessions/:id/buffer/stats", get(get_buffer_stats))
        .route("/api/fs/browse", get(fs_browse))
        .route("/api/mkdir", post(fs_mkdir))
        .route("/api/remotes", get(list_remotes))
        .route("/api/remotes/register", post(register_remote))
        .route("/api/remotes/:id", delete(unregister_remote))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            hq_session_routing,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let mut app = Router::new()
        .merge(api)
        // The upgrade request cannot carry headers from a browser, so it
        // authenticates inside the handler.
        .route("/buffers", get(buffers_ws));

    if let Some(static_path) = &state.config.static_path {
        app = app.fallback_service(ServeDir::new(static_path));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Starts the server and blocks until shutdown. Running sessions are marked
/// exited before this returns.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let broadcaster = Broadcaster::new();
    let manager = SessionManager::new(config.control_path.clone(), broadcaster.clone())?;
    let registry = if config.hq_mode {
        Some(RemoteRegistry::new()?)
    } else {
        None
    };

    let announcer = match &config.hq {
        Some(target) => {
            let advertised = format!("http://{}:{}", config.bind, config.port);
            Some(Arc::new(HqAnnouncer::new(target.clone(), advertised)?))
        }
        None => None,
    };

    let auth = AuthSettings {
        credentials: config.credentials.clone(),
        bearer_token: announcer.as_ref().map(|a| a.token().to_string()),
    };

    let state = Arc::new(AppState {
        manager: manager.clone(),
        broadcaster,
        buffers: Arc::new(BufferCache::new()),
        registry: registry.clone(),
        proxy_client: proxy::proxy_client()?,
        auth,
        config: config.clone(),
    });

    let app = build_router(state);
    let listener = TcpListener::bind((config.bind, config.port))
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}:{}: {e}", config.bind, config.port))?;
    info!(bind = %config.bind, port = config.port, hq = config.hq_mode, "server listening");

    if let Some(registry) = &registry {
        registry.spawn_health_loop();
    }
    if let Some(announcer) = announcer.clone() {
        tokio::spawn(async move {
            if let Err(e) = announcer.register().await {
                warn!(error = %e, "HQ registration abandoned");
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, terminating sessions");
    manager.shutdown_all().await;
    if let Some(announcer) = announcer {
        announcer.unregister().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// middleware

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth.allows(request.headers(), None) {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

/// In HQ mode, a request touching a session some remote owns is forwarded to
/// that remote unchanged. Unknown ids fall through to the local handlers.
async fn hq_session_routing(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(registry) = &state.registry {
        if let Some(session_id) = session_id_from_path(request.uri().path()) {
            if let Some(remote) = registry.remote_for_session(&session_id).await {
                return match proxy::forward(&state.proxy_client, &remote, request).await {
                    Ok(response) => response,
                    Err(e) => e.into_response(),
                };
            }
        }
    }
    next.run(request).await
}

fn session_id_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/api/sessions/")?;
    let id = rest.split('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

// ---------------------------------------------------------------------------
// request/response bodies

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    command: Vec<String>,
    #[serde(rename = "workingDir")]
    working_dir: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cols: Option<i64>,
    #[serde(default)]
    rows: Option<i64>,
    /// Accepted for API compatibility; this server always records.
    #[serde(default, rename = "spawn_terminal")]
    _spawn_terminal: Option<bool>,
    #[serde(default)]
    term: Option<String>,
    #[serde(default, rename = "remoteId")]
    remote_id: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: i64,
    rows: i64,
}

#[derive(Debug, Deserialize)]
struct BrowseQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
struct MkdirRequest {
    parent: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct BufferQuery {
    #[serde(default)]
    format: Option<String>,
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
struct SnapshotResponse {
    session_id: String,
    header: crate::stream::AsciicastHeader,
    events: Vec<crate::stream::StreamEvent>,
}

#[derive(Serialize)]
struct CleanupExitedResponse {
    #[serde(rename = "localCleaned")]
    local_cleaned: usize,
    #[serde(rename = "remoteResults")]
    remote_results: Vec<crate::hq::RemoteCleanupResult>,
}

// ---------------------------------------------------------------------------
// handlers

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SessionListEntry>>> {
    let local = state.manager.list().await?;
    match &state.registry {
        Some(registry) => Ok(Json(registry.aggregate_sessions(local).await)),
        None => Ok(Json(local)),
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    // HQ can place a session on a specific remote.
    let remote_target = request.remote_id.clone();
    if let (Some(registry), Some(remote_id)) = (&state.registry, remote_target) {
        let remote = registry
            .remote_by_id(&remote_id)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("remote {remote_id}")))?;
        let forward = serde_json::json!({
            "command": request.command,
            "workingDir": request.working_dir,
            "name": request.name,
            "cols": request.cols,
            "rows": request.rows,
            "term": request.term,
        });
        let response = state
            .proxy_client
            .post(format!("{}/api/sessions", remote.url))
            .bearer_auth(&remote.token)
            .json(&forward)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "remote {} returned {}",
                remote.name,
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?;
        return Ok(Json(CreateSessionResponse {
            session_id: body
                .get("sessionId")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
        }));
    }

    let cols = validate_dimension(request.cols, "cols")?;
    let rows = validate_dimension(request.rows, "rows")?;
    let info = state
        .manager
        .create(CreateSession {
            command: request.command,
            working_dir: request.working_dir,
            name: request.name,
            cols,
            rows,
            term: request.term,
        })
        .await?;
    Ok(Json(CreateSessionResponse {
        session_id: info.session_id,
    }))
}

fn validate_dimension(value: Option<i64>, field: &str) -> ApiResult<Option<u16>> {
    match value {
        None => Ok(None),
        Some(v) if v > 0 && v <= u16::MAX as i64 => Ok(Some(v as u16)),
        Some(v) => Err(ApiError::BadRequest(format!(
            "{field} must be strictly positive, got {v}"
        ))),
    }
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<SessionListEntry>> {
    Ok(Json(state.manager.get(&session_id).await?))
}

/// Kill. A second delete of the same session answers 410 but still reports
/// success: the desired state holds either way.
async fn delete_session(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.manager.kill(&session_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessBody {
                success: true,
                message: None,
            }),
        )
            .into_response(),
        Err(ApiError::Gone) => (
            StatusCode::GONE,
            Json(SuccessBody {
                success: true,
                message: Some("session already exited".to_string()),
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cleanup_session(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.manager.cleanup(&session_id).await?;
    state.buffers.evict(&session_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn cleanup_exited(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let local_cleaned = state.manager.cleanup_exited().await?;
    match &state.registry {
        Some(registry) => {
            let remote_results = registry.cleanup_exited_remotes().await;
            Ok(Json(CleanupExitedResponse {
                local_cleaned,
                remote_results,
            })
            .into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn post_input(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
    Json(request): Json<InputRequest>,
) -> ApiResult<StatusCode> {
    let payload = request
        .input
        .or(request.text)
        .ok_or_else(|| ApiError::BadRequest("missing input".into()))?;
    state.manager.send_input(&session_id, &payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_resize(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
    Json(request): Json<ResizeRequest>,
) -> ApiResult<Json<SuccessBody>> {
    let cols = validate_dimension(Some(request.cols), "cols")?.expect("validated");
    let rows = validate_dimension(Some(request.rows), "rows")?.expect("validated");
    state.manager.resize(&session_id, cols, rows).await?;
    Ok(Json(SuccessBody {
        success: true,
        message: None,
    }))
}

async fn stream_session(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let entry = state.manager.get(&session_id).await?;
    let exit_code = match entry.info.status {
        SessionStatus::Exited => Some(entry.info.exit_code),
        _ => None,
    };
    let stream_path = session::stream_out_path(&state.manager.session_dir(&session_id));
    let mut events = state
        .broadcaster
        .subscribe(&session_id, stream_path, exit_code)
        .await;

    // The session may have exited between the status read and the
    // subscription; re-check so the fanout always learns about the exit.
    if exit_code.is_none() {
        if let Ok(entry) = state.manager.get(&session_id).await {
            if entry.info.status == SessionStatus::Exited {
                state
                    .broadcaster
                    .notify_exit(&session_id, entry.info.exit_code)
                    .await;
            }
        }
    }

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event {
                LiveEvent::Event(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                LiveEvent::Exit { code } => {
                    let payload = serde_json::json!({ "type": "exit", "code": code });
                    yield Ok(Event::default().event("end").data(payload.to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE)))
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<SnapshotResponse>> {
    state.manager.get(&session_id).await?;
    let stream_path = session::stream_out_path(&state.manager.session_dir(&session_id));
    let (header, events) = crate::stream::snapshot(&stream_path)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(SnapshotResponse {
        session_id,
        header,
        events,
    }))
}

async fn get_buffer(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
    Query(query): Query<BufferQuery>,
) -> ApiResult<Response> {
    state.manager.get(&session_id).await?;
    let session_dir = state.manager.session_dir(&session_id);
    let snapshot = state
        .buffers
        .snapshot(&session_id, &session_dir)
        .await
        .map_err(ApiError::Internal)?;

    match query.format.as_deref() {
        Some("json") => Ok(Json(snapshot.as_ref().clone()).into_response()),
        Some("binary") | None => Ok((
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            snapshot.encode(),
        )
            .into_response()),
        Some(other) => Err(ApiError::BadRequest(format!("unknown format {other:?}"))),
    }
}

async fn get_buffer_stats(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<crate::term::BufferStats>> {
    state.manager.get(&session_id).await?;
    let session_dir = state.manager.session_dir(&session_id);
    let snapshot = state
        .buffers
        .snapshot(&session_id, &session_dir)
        .await
        .map_err(ApiError::Internal)?;
    let last_modified = session::stream_last_modified(&session_dir);
    Ok(Json(snapshot.stats(last_modified)))
}

async fn fs_browse(
    Query(query): Query<BrowseQuery>,
) -> ApiResult<Json<fs_api::DirListing>> {
    Ok(Json(fs_api::browse(&query.path)?))
}

async fn fs_mkdir(Json(request): Json<MkdirRequest>) -> ApiResult<Json<fs_api::MkdirResult>> {
    Ok(Json(fs_api::mkdir(&request.parent, &request.name)?))
}

fn require_hq(state: &AppState) -> ApiResult<&Arc<RemoteRegistry>> {
    state
        .registry
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("server is not running in HQ mode".into()))
}

async fn list_remotes(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<crate::hq::RemoteSummary>>> {
    let registry = require_hq(&state)?;
    Ok(Json(registry.list().await))
}

async fn register_remote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRemote>,
) -> ApiResult<StatusCode> {
    let registry = require_hq(&state)?;
    registry.register(request).await?;
    // First probe right away so the new remote's sessions route.
    let registry = registry.clone();
    tokio::spawn(async move { registry.probe_all().await });
    Ok(StatusCode::CREATED)
}

async fn unregister_remote(
    State(state): State<Arc<AppState>>,
    AxumPath(remote_id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let registry = require_hq(&state)?;
    registry.unregister(&remote_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn buffers_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state
        .auth
        .allows(&headers, params.get("token").map(String::as_str))
    {
        return ApiError::Unauthorized.into_response();
    }
    let manager = state.manager.clone();
    let broadcaster = state.broadcaster.clone();
    let buffers = state.buffers.clone();
    ws.on_upgrade(move |socket| ws::handle_socket(socket, manager, broadcaster, buffers))
}
