//! HTTP server: the streaming chat endpoint and the auxiliary surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat/stream` | SSE answer stream (§ wire protocol) |
//! | `POST` | `/chat` | Non-streaming variant, single JSON reply |
//! | `GET`  | `/chat/history/{session_id}` | Session transcript |
//! | `DELETE` | `/chat/history/{session_id}` | Clear a session |
//! | `GET`  | `/settings/{user_id}` | Load settings |
//! | `POST` | `/settings` | Save settings (`?user_id=`) |
//! | `POST` | `/test-connection` | Probe candidate settings |
//! | `GET`  | `/sources` | Registered sources, circuit state, health |
//! | `GET`  | `/health` | Liveness |
//!
//! Client disconnect on the SSE stream drops the receiving side of the
//! event channel; the pipeline notices on its next write and cancels the
//! query within the shutdown grace.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query as UrlQuery, State},
    http::{HeaderValue, Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::Core;
use crate::error::ErrorKind;
use crate::llm::{self, GenParams};
use crate::models::{Query, Settings, SourceId, Turn};
use crate::pipeline;
use crate::protocol::StreamEvent;
use crate::source::SourceRegistry;

#[derive(Clone)]
struct AppState {
    core: Arc<Core>,
}

/// Bind and serve until the process is terminated.
pub async fn run_server(core: Arc<Core>) -> anyhow::Result<()> {
    let bind_addr = core.config.server.bind.clone();
    let cors = cors_layer(&core.config.server.cors_origins);
    let state = AppState { core };

    let app = Router::new()
        .route("/chat/stream", post(handle_chat_stream))
        .route("/chat", post(handle_chat))
        .route(
            "/chat/history/:session_id",
            get(handle_history).delete(handle_clear_history),
        )
        .route("/settings/:user_id", get(handle_get_settings))
        .route("/settings", post(handle_save_settings))
        .route("/test-connection", post(handle_test_connection))
        .route("/sources", get(handle_sources))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, Any, CorsLayer};
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

// ============ Error envelope ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn query_error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Deadline | ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::ClientSlow | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============ chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    session_id: String,
}

#[derive(Deserialize)]
struct UserIdParam {
    #[serde(default = "default_user")]
    user_id: String,
}

fn default_user() -> String {
    "default".to_string()
}

async fn load_settings_or_400(state: &AppState, user_id: &str) -> Result<Settings, AppError> {
    match state.core.store.load_settings(user_id).await {
        Ok(Some(settings)) => Ok(settings),
        Ok(None) => Err(bad_request("user settings not configured")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

fn build_query(state: &AppState, request: &ChatRequest, settings: &Settings, user_id: &str) -> Query {
    Query {
        text: request.message.clone(),
        session_id: request.session_id.clone(),
        user_id: user_id.to_string(),
        deadline: Instant::now() + state.core.config.query_deadline(),
        options: state.core.query_options(settings),
    }
}

/// `POST /chat/stream` — the SSE pipeline.
async fn handle_chat_stream(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<UserIdParam>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let settings = load_settings_or_400(&state, &params.user_id).await?;
    let query = build_query(&state, &request, &settings, &params.user_id);

    let (tx, rx) = mpsc_for_stream(&state);
    let cancel = CancellationToken::new();
    let core = Arc::clone(&state.core);
    tokio::spawn(async move {
        pipeline::run_query(&core, query, settings, tx, cancel).await;
    });

    let stream = ReceiverStream::new(rx)
        .map(|event| Ok(Event::default().data(serde_json::to_string(&event).unwrap_or_default())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn mpsc_for_stream(
    state: &AppState,
) -> (
    tokio::sync::mpsc::Sender<StreamEvent>,
    tokio::sync::mpsc::Receiver<StreamEvent>,
) {
    tokio::sync::mpsc::channel(state.core.config.llm.token_channel_cap)
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    sources: Vec<SourceId>,
    used_sources: Vec<SourceId>,
    documents: Vec<crate::protocol::DocumentRef>,
}

/// `POST /chat` — single JSON reply.
async fn handle_chat(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<UserIdParam>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let settings = load_settings_or_400(&state, &params.user_id).await?;
    let query = build_query(&state, &request, &settings, &params.user_id);

    match pipeline::run_query_collected(&state.core, query, settings).await {
        Ok(outcome) => Ok(Json(ChatResponse {
            response: outcome.response,
            sources: outcome.sources,
            used_sources: outcome.used_sources,
            documents: outcome.documents,
        })),
        Err(e) => Err(AppError {
            status: query_error_status(e.kind),
            code: e.kind.as_str().to_string(),
            message: e.message,
        }),
    }
}

// ============ history ============

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<Turn>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let history = state
        .core
        .store
        .history(&session_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(HistoryResponse { history }))
}

async fn handle_clear_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .store
        .clear_history(&session_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ settings ============

async fn handle_get_settings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let settings = state
        .core
        .store
        .load_settings(&user_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "settings": settings,
    })))
}

async fn handle_save_settings(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<UserIdParam>,
    Json(settings): Json<Settings>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .store
        .save_settings(&params.user_id, &settings)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ test-connection ============

#[derive(Serialize)]
struct ProbeResult {
    status: String,
    message: String,
}

/// `POST /test-connection` — probe candidate settings without saving them.
async fn handle_test_connection(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Json<HashMap<String, ProbeResult>> {
    let mut results = HashMap::new();

    let streamer = llm::create_streamer(settings.llm_provider);
    let params = GenParams::from_settings(&settings, 1);
    let llm_result = match streamer.probe(&params).await {
        Ok(()) => ProbeResult {
            status: "success".to_string(),
            message: "LLM connection successful".to_string(),
        },
        Err(e) => ProbeResult {
            status: "error".to_string(),
            message: e.to_string(),
        },
    };
    results.insert("llm".to_string(), llm_result);

    let store_result = match state.core.store.ping().await {
        Ok(()) => ProbeResult {
            status: "success".to_string(),
            message: "store reachable".to_string(),
        },
        Err(e) => ProbeResult {
            status: "error".to_string(),
            message: e.to_string(),
        },
    };
    results.insert("store".to_string(), store_result);

    Json(results)
}

// ============ sources ============

#[derive(Serialize)]
struct SourceStatus {
    source: SourceId,
    configured: bool,
    circuit: crate::breaker::CircuitState,
    healthy: Option<bool>,
    window_remaining: usize,
}

/// `GET /sources` — every source with circuit state and a live health probe
/// for the configured ones.
async fn handle_sources(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<UserIdParam>,
) -> Result<Json<Vec<SourceStatus>>, AppError> {
    let settings = state
        .core
        .store
        .load_settings(&params.user_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .unwrap_or_else(default_probe_settings);
    let registry = SourceRegistry::from_config(&state.core.config, &settings);

    let mut statuses = Vec::new();
    for id in SourceId::ALL {
        let adapter = registry.get(id);
        let healthy = match &adapter {
            Some(adapter) => Some(adapter.healthy().await),
            None => None,
        };
        statuses.push(SourceStatus {
            source: id,
            configured: adapter.is_some() || id == SourceId::VectorCache,
            circuit: state.core.breaker.state(id),
            healthy,
            window_remaining: state.core.rategate.remaining(id),
        });
    }
    Ok(Json(statuses))
}

fn default_probe_settings() -> Settings {
    Settings {
        llm_provider: crate::models::LlmProviderId::Openai,
        llm_model: String::new(),
        llm_api_key: String::new(),
        credentials: HashMap::new(),
        enable_web_search: false,
        use_streaming: false,
        enabled_sources: Default::default(),
    }
}

// ============ health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    time: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        time: chrono::Utc::now().to_rfc3339(),
    })
}
