//! HTTP API server.
//!
//! Exposes search, chat, tagging, link discovery, and index maintenance
//! over JSON, with chat optionally streamed as Server-Sent Events.
//!
//! # Endpoints
//!
//! | Method   | Path               | Description |
//! |----------|--------------------|-------------|
//! | `POST`   | `/api/search`      | Keyword / semantic / mixed search |
//! | `POST`   | `/api/chat`        | RAG chat (SSE stream or aggregated JSON) |
//! | `POST`   | `/api/tags/suggest`| Tag suggestions for a note |
//! | `POST`   | `/api/links`       | Related-document discovery |
//! | `POST`   | `/api/index`       | Upsert a document into the index |
//! | `DELETE` | `/api/index/{id}`  | Remove a document from the index |
//! | `GET`    | `/api/status`      | AI availability and index stats |
//! | `GET`    | `/health`          | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_argument", "message": "Unknown search mode: fuzzy. ..." } }
//! ```
//!
//! Error codes: `invalid_argument` (400), `not_found` (404), `timeout`
//! (408), `internal` (500). Degraded responses are NOT errors: they
//! come back 200 with `degraded: true`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based
//! note editors can call the API directly.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::availability::AvailabilityMonitor;
use crate::backend::BackendClient;
use crate::chat::{ChatOrchestrator, ChatRequest};
use crate::config::Config;
use crate::degrade::DegradationController;
use crate::error::Error;
use crate::index::{IndexStore, UpsertOutcome};
use crate::models::Document;
use crate::protocol::{encode_done, encode_frame, Frame};
use crate::search::{RetrievalEngine, SearchMode};

/// How many chunks the background embedding pass sends per batch.
const BACKFILL_BATCH: usize = 32;
const BACKFILL_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub index: Arc<dyn IndexStore>,
    pub backend: Arc<BackendClient>,
    pub monitor: Arc<AvailabilityMonitor>,
    pub controller: Arc<DegradationController>,
    pub orchestrator: Arc<ChatOrchestrator>,
}

impl AppState {
    /// Wire up the full pipeline around an index store. Used by both
    /// `kb serve` and the one-shot CLI commands.
    pub fn build(config: Arc<Config>, index: Arc<dyn IndexStore>) -> anyhow::Result<Self> {
        let backend = Arc::new(BackendClient::new(&config.ai)?);
        let monitor = Arc::new(AvailabilityMonitor::new(backend.clone(), &config.ai));
        let engine = RetrievalEngine::new(index.clone(), &config.retrieval);
        let controller = Arc::new(DegradationController::new(
            monitor.clone(),
            engine,
            backend.clone(),
            index.clone(),
            config.retrieval.similarity_threshold,
            config.tags.max_tags,
        ));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            controller.clone(),
            backend.clone(),
            config.chat.clone(),
        ));

        Ok(Self {
            config,
            index,
            backend,
            monitor,
            controller,
            orchestrator,
        })
    }
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated. Also spawns the background embedding backfill task.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();

    tokio::spawn(embedding_backfill(
        state.index.clone(),
        state.backend.clone(),
        state.monitor.clone(),
    ));

    let app = router(state);

    tracing::info!("listening on http://{}", bind_addr);
    println!("knowbase server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full API router. Split out from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/search", post(handle_search))
        .route("/api/chat", post(handle_chat))
        .route("/api/tags/suggest", post(handle_suggest_tags))
        .route("/api/links", post(handle_links))
        .route("/api/index", post(handle_index_upsert))
        .route("/api/index/{id}", delete(handle_index_remove))
        .route("/api/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Periodically embeds chunks that were indexed while the backend was
/// unavailable (or faster than embedding keeps up).
async fn embedding_backfill(
    index: Arc<dyn IndexStore>,
    backend: Arc<BackendClient>,
    monitor: Arc<AvailabilityMonitor>,
) {
    let mut ticker = tokio::time::interval(BACKFILL_INTERVAL);
    loop {
        ticker.tick().await;

        if !monitor.is_available(false).await {
            continue;
        }

        let pending = match index.pending_embeddings(BACKFILL_BATCH).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list pending embeddings");
                continue;
            }
        };
        if pending.is_empty() {
            continue;
        }

        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        let vectors = match backend.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!(error = %e, count = pending.len(), "embedding backfill failed");
                continue;
            }
        };

        let mut stored = 0;
        for (chunk, vector) in pending.iter().zip(vectors) {
            match index.set_embedding(&chunk.chunk_id, vector).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!(error = %e, chunk_id = %chunk.chunk_id, "failed to store embedding"),
            }
        }
        tracing::debug!(stored, "embedding backfill pass complete");
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
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

/// `Json` extractor whose rejection follows the documented error
/// contract instead of axum's plain-text default.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_argument".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Map pipeline errors onto the HTTP error contract. Degradable errors
/// never reach this point for search and tags (the controller converts
/// them to degraded 200s); what arrives here is genuinely the caller's
/// fault or an internal failure.
fn classify_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidArgument(msg)) => {
            if msg.starts_with("Unknown document") {
                not_found(msg.clone())
            } else {
                bad_request(msg.clone())
            }
        }
        Some(Error::Timeout) => AppError {
            status: StatusCode::REQUEST_TIMEOUT,
            code: "timeout".to_string(),
            message: "upstream request timed out".to_string(),
        },
        _ => {
            tracing::error!(error = %err, "internal error");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: err.to_string(),
            }
        }
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    search_type: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_search(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SearchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mode: SearchMode = req
        .search_type
        .as_deref()
        .unwrap_or("mixed")
        .parse()
        .map_err(|e: Error| bad_request(e.to_string()))?;
    let limit = req.limit.unwrap_or(state.config.retrieval.default_limit);

    let response = state
        .controller
        .search(&req.query, mode, limit)
        .await
        .map_err(classify_error)?;
    Ok(Json(response))
}

#[derive(Serialize)]
struct ChatAggregateResponse {
    message: crate::models::ChatMessage,
    related_documents: Vec<crate::models::RelatedDocument>,
}

async fn handle_chat(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ChatRequest>,
) -> Result<Response, AppError> {
    if req.last_user_message().is_none() {
        return Err(bad_request("request must contain a user message"));
    }

    if !req.stream {
        let (message, related_documents) = state
            .orchestrator
            .run_aggregate(&req)
            .await
            .map_err(classify_error)?;
        return Ok(Json(ChatAggregateResponse {
            message,
            related_documents,
        })
        .into_response());
    }

    let (tx, rx) = mpsc::channel::<Frame>(32);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run(&req, tx).await {
            tracing::error!(error = %e, "chat pipeline failed");
        }
    });

    // Frames until the channel closes, then the [DONE] sentinel. A
    // client disconnect drops the receiver and cancels the pipeline.
    let stream = futures::stream::unfold(Some(rx), |receiver| async move {
        let mut rx = receiver?;
        match rx.recv().await {
            Some(frame) => Some((Bytes::from(encode_frame(&frame)), Some(rx))),
            None => Some((Bytes::from(encode_done()), None)),
        }
    })
    .map(Ok::<_, std::convert::Infallible>);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[derive(Deserialize)]
struct TagSuggestRequest {
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    max_tags: Option<usize>,
}

async fn handle_suggest_tags(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TagSuggestRequest>,
) -> impl IntoResponse {
    let response = state
        .controller
        .suggest_tags(&req.title, &req.content, req.max_tags)
        .await;
    Json(response)
}

#[derive(Deserialize)]
struct LinkRequest {
    document_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_links(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LinkRequest>,
) -> Result<impl IntoResponse, AppError> {
    let limit = req.limit.unwrap_or(10);
    let response = state
        .controller
        .discover_links(&req.document_id, limit)
        .await
        .map_err(classify_error)?;
    Ok(Json(response))
}

#[derive(Serialize)]
struct IndexResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<usize>,
}

async fn handle_index_upsert(
    State(state): State<AppState>,
    ApiJson(doc): ApiJson<Document>,
) -> Result<impl IntoResponse, AppError> {
    if doc.id.trim().is_empty() {
        return Err(bad_request("document id must not be empty"));
    }

    let outcome = state.index.upsert(&doc).await.map_err(classify_error)?;
    let response = match outcome {
        UpsertOutcome::Indexed { chunks } => IndexResponse {
            status: "indexed",
            chunks: Some(chunks),
        },
        UpsertOutcome::Unchanged => IndexResponse {
            status: "unchanged",
            chunks: None,
        },
        UpsertOutcome::Removed => IndexResponse {
            status: "removed",
            chunks: None,
        },
    };
    Ok(Json(response))
}

async fn handle_index_remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.index.remove(&id).await.map_err(classify_error)?;
    Ok(Json(IndexResponse {
        status: "removed",
        chunks: None,
    }))
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, AppError> {
    let available = state.monitor.is_available(query.refresh).await;
    let ai = state.monitor.state().await;
    let documents = state.index.document_count().await.map_err(classify_error)?;

    Ok(Json(serde_json::json!({
        "ai": ai,
        "available": available,
        "documents": documents,
    })))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
