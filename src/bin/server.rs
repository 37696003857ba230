//! Persona Memory Server
//!
//! HTTP API over the reconciliation engine.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use persona_memory::{
    AuditEntry, Config, EmbeddingBackend, Error, ExtractiveAnswerer, FastEmbedder,
    HashingEmbedder, MemoryEngine, MemoryRecord, Ports, RetrievedHit, SentenceExtractor,
};

/// Application state shared across handlers
struct AppState {
    engine: MemoryEngine,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Persona Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let embedder: Arc<dyn persona_memory::Embedder> = match config.embedding_backend {
        EmbeddingBackend::Fastembed => Arc::new(FastEmbedder::new(&config)?),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::from_config(&config)),
    };
    let ports = Ports::new(
        embedder,
        Arc::new(SentenceExtractor),
        Arc::new(ExtractiveAnswerer::default()),
    );

    let port = config.server_port;
    let engine = MemoryEngine::open(config, ports).await?;
    let state = Arc::new(AppState { engine });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Reconciliation
        .route("/personas/:persona/messages", post(add_message))
        // Retrieval
        .route("/personas/:persona/search", post(search))
        .route("/personas/:persona/ask", post(ask))
        // Inspection
        .route("/personas/:persona/memories", get(list_memories))
        .route("/personas/:persona/audit", get(audit_log))
        // Recovery
        .route("/personas/:persona/rollback", post(rollback))
        .route("/personas/:persona/rebuild", post(rebuild))
        .route("/personas/:persona/reset", post(reset))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Map an engine error to an HTTP status, logging it
fn error_status(e: Error) -> StatusCode {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::VersionConflict { .. } => StatusCode::CONFLICT,
        Error::ConsistencyViolation { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::PortUnavailable { .. } | Error::NonFiniteEmbedding { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(status = %status, error = %e, "Request failed");
    status
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Reconciliation handlers ---

#[derive(Debug, Deserialize)]
struct AddMessageRequest {
    text: String,
    infer: Option<bool>,
}

async fn add_message(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
    Json(req): Json<AddMessageRequest>,
) -> Result<Json<Vec<AuditEntryResponse>>, StatusCode> {
    let entries = state
        .engine
        .add_message_with(&persona, &req.text, req.infer.unwrap_or(true))
        .await
        .map_err(error_status)?;

    Ok(Json(entries.iter().map(AuditEntryResponse::from).collect()))
}

// --- Retrieval handlers ---

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    k: Option<usize>,
    threshold: Option<f32>,
}

async fn search(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<RetrievedHit>>, StatusCode> {
    let k = req.k.unwrap_or(state.engine.config().top_k);
    let hits = state
        .engine
        .search_with_threshold(&persona, &req.query, k, req.threshold)
        .await
        .map_err(error_status)?;

    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    question: String,
    k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    answer: String,
    sources: Vec<RetrievedHit>,
    context_tokens: u32,
}

async fn ask(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, StatusCode> {
    let k = req.k.unwrap_or(state.engine.config().top_k);
    let answer = state
        .engine
        .answer(&persona, &req.question, k)
        .await
        .map_err(error_status)?;

    Ok(Json(AskResponse {
        answer: answer.text,
        sources: answer.sources,
        context_tokens: answer.context_tokens,
    }))
}

// --- Inspection handlers ---

async fn list_memories(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
) -> Result<Json<Vec<MemoryResponse>>, StatusCode> {
    let records = state
        .engine
        .list_active(&persona)
        .await
        .map_err(error_status)?;

    Ok(Json(records.iter().map(MemoryResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    upto: Option<u64>,
}

async fn audit_log(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntryResponse>>, StatusCode> {
    let entries = state
        .engine
        .audit_log(&persona, query.upto)
        .map_err(error_status)?;

    Ok(Json(entries.iter().map(AuditEntryResponse::from).collect()))
}

// --- Recovery handlers ---

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    upto_sequence: u64,
}

async fn rollback(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<Vec<AuditEntryResponse>>, StatusCode> {
    let entries = state
        .engine
        .rollback(&persona, req.upto_sequence)
        .await
        .map_err(error_status)?;

    Ok(Json(entries.iter().map(AuditEntryResponse::from).collect()))
}

#[derive(Debug, Serialize)]
struct RebuildResponse {
    active_records: usize,
}

async fn rebuild(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
) -> Result<Json<RebuildResponse>, StatusCode> {
    let active_records = state.engine.rebuild(&persona).await.map_err(error_status)?;
    Ok(Json(RebuildResponse { active_records }))
}

async fn reset(
    State(state): State<SharedState>,
    Path(persona): Path<String>,
) -> Result<Json<Vec<AuditEntryResponse>>, StatusCode> {
    let entries = state.engine.reset(&persona).await.map_err(error_status)?;
    Ok(Json(entries.iter().map(AuditEntryResponse::from).collect()))
}

// === Response types ===

#[derive(Debug, Serialize)]
struct MemoryResponse {
    id: String,
    content: String,
    state: String,
    version: u64,
    created_at: String,
    updated_at: String,
}

impl From<&MemoryRecord> for MemoryResponse {
    fn from(r: &MemoryRecord) -> Self {
        Self {
            id: r.id.to_string(),
            content: r.content.clone(),
            state: r.state.to_string(),
            version: r.version,
            created_at: r.created_at.to_rfc3339(),
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

/// Audit entry without embeddings
#[derive(Debug, Serialize)]
struct AuditEntryResponse {
    sequence_no: u64,
    action: String,
    record_id: Option<String>,
    before: Option<MemoryResponse>,
    after: Option<MemoryResponse>,
    candidate_text: String,
    error: Option<String>,
    timestamp: String,
}

impl From<&AuditEntry> for AuditEntryResponse {
    fn from(e: &AuditEntry) -> Self {
        Self {
            sequence_no: e.sequence_no,
            action: e.action.to_string(),
            record_id: e.record_id.map(|id| id.to_string()),
            before: e.before_snapshot.as_ref().map(MemoryResponse::from),
            after: e.after_snapshot.as_ref().map(MemoryResponse::from),
            candidate_text: e.candidate_text.clone(),
            error: e.error.clone(),
            timestamp: e.timestamp.to_rfc3339(),
        }
    }
}
