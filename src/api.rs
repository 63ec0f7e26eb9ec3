//! HTTP surface for rustydoc.
//!
//! This module exposes a compact Axum router over the session context:
//!
//! - `POST /documents` – Build or refresh the vector and summary indexes from documents.
//! - `POST /query` – Answer a question from the vector index.
//! - `POST /summarize` – Summarise the summary index with a response mode.
//! - `GET /models` / `PUT /models/selected` – List installed models and pick one.
//! - `GET /health` – Daemon liveness and session state.
//! - `GET /metrics` – Index cache counters.
//! - `DELETE /indexes/:name` / `DELETE /indexes` – Evict one or every persisted index.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.

use crate::context::{AppContext, ContextError, HealthReport, IngestReport, ModelListing};
use crate::index::{Document, IndexName};
use crate::metrics::MetricsSnapshot;
use crate::query::{QueryAnswer, ResponseMode};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Operations the HTTP layer needs from the application.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Build or refresh both default indexes.
    async fn ingest(&self, documents: Vec<Document>) -> IngestReport;
    /// Answer a question from the vector index.
    async fn ask(&self, question: &str, top_k: Option<usize>, widen: Option<bool>) -> QueryAnswer;
    /// Summarise the summary index.
    async fn summarize(&self, mode: Option<ResponseMode>, instruction: Option<&str>)
    -> QueryAnswer;
    /// Installed models with the current selection.
    async fn model_listing(&self) -> ModelListing;
    /// Select the generation model.
    async fn select_model(&self, model: &str) -> Result<(), ContextError>;
    /// Daemon and session status.
    async fn health(&self) -> HealthReport;
    /// Index cache counters.
    fn metrics(&self) -> MetricsSnapshot;
    /// Evict one persisted index.
    async fn evict(&self, name: &IndexName) -> Result<bool, ContextError>;
    /// Evict every persisted index.
    async fn clear_all(&self) -> Result<usize, ContextError>;
}

#[async_trait]
impl DocumentApi for AppContext {
    async fn ingest(&self, documents: Vec<Document>) -> IngestReport {
        AppContext::ingest(self, documents).await
    }

    async fn ask(&self, question: &str, top_k: Option<usize>, widen: Option<bool>) -> QueryAnswer {
        AppContext::ask(self, question, top_k, widen).await
    }

    async fn summarize(
        &self,
        mode: Option<ResponseMode>,
        instruction: Option<&str>,
    ) -> QueryAnswer {
        AppContext::summarize(self, mode, instruction).await
    }

    async fn model_listing(&self) -> ModelListing {
        AppContext::model_listing(self).await
    }

    async fn select_model(&self, model: &str) -> Result<(), ContextError> {
        AppContext::select_model(self, model).await
    }

    async fn health(&self) -> HealthReport {
        AppContext::health(self).await
    }

    fn metrics(&self) -> MetricsSnapshot {
        AppContext::metrics(self)
    }

    async fn evict(&self, name: &IndexName) -> Result<bool, ContextError> {
        AppContext::evict(self, name).await
    }

    async fn clear_all(&self) -> Result<usize, ContextError> {
        AppContext::clear_all(self).await
    }
}

/// Build the HTTP router over `service`.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: DocumentApi + 'static,
{
    Router::new()
        .route("/documents", post(ingest_documents::<S>))
        .route("/query", post(query::<S>))
        .route("/summarize", post(summarize::<S>))
        .route("/models", get(list_models::<S>))
        .route("/models/selected", put(select_model::<S>))
        .route("/health", get(health::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/indexes", delete(clear_indexes::<S>))
        .route("/indexes/:name", delete(evict_index::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Request body for `POST /documents`.
#[derive(Deserialize)]
struct IngestRequest {
    documents: Vec<Document>,
}

async fn ingest_documents<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestReport>, AppError>
where
    S: DocumentApi,
{
    if request.documents.is_empty() {
        return Err(AppError::BadRequest("no documents supplied".into()));
    }
    if let Some(document) = request.documents.iter().find(|doc| doc.id.trim().is_empty()) {
        return Err(AppError::BadRequest(format!(
            "document with empty id ({} bytes of text)",
            document.text.len()
        )));
    }
    Ok(Json(service.ingest(request.documents).await))
}

/// Request body for `POST /query`.
#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    widen: Option<bool>,
}

/// Response body shared by `POST /query` and `POST /summarize`.
#[derive(Serialize)]
struct AnswerResponse {
    status: &'static str,
    answer: String,
}

impl From<QueryAnswer> for AnswerResponse {
    fn from(answer: QueryAnswer) -> Self {
        Self {
            status: answer.status(),
            answer: answer.to_string(),
        }
    }
}

async fn query<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<QueryRequest>,
) -> Json<AnswerResponse>
where
    S: DocumentApi,
{
    let answer = service
        .ask(&request.question, request.top_k, request.widen)
        .await;
    tracing::info!(status = answer.status(), "Query request completed");
    Json(answer.into())
}

/// Request body for `POST /summarize`.
#[derive(Deserialize)]
struct SummarizeRequest {
    #[serde(default)]
    mode: Option<ResponseMode>,
    #[serde(default)]
    instruction: Option<String>,
}

async fn summarize<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SummarizeRequest>,
) -> Json<AnswerResponse>
where
    S: DocumentApi,
{
    let answer = service
        .summarize(request.mode, request.instruction.as_deref())
        .await;
    tracing::info!(status = answer.status(), "Summary request completed");
    Json(answer.into())
}

async fn list_models<S>(State(service): State<Arc<S>>) -> Json<ModelListing>
where
    S: DocumentApi,
{
    Json(service.model_listing().await)
}

/// Request body for `PUT /models/selected`.
#[derive(Deserialize)]
struct SelectModelRequest {
    model: String,
}

async fn select_model<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SelectModelRequest>,
) -> Result<StatusCode, AppError>
where
    S: DocumentApi,
{
    service.select_model(&request.model).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health<S>(State(service): State<Arc<S>>) -> Json<HealthReport>
where
    S: DocumentApi,
{
    Json(service.health().await)
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: DocumentApi,
{
    Json(service.metrics())
}

async fn evict_index<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError>
where
    S: DocumentApi,
{
    let name = IndexName::new(name).map_err(|error| AppError::BadRequest(error.to_string()))?;
    let removed = service.evict(&name).await?;
    Ok(Json(json!({ "index": name, "removed": removed })))
}

async fn clear_indexes<S>(State(service): State<Arc<S>>) -> Result<Json<serde_json::Value>, AppError>
where
    S: DocumentApi,
{
    let removed = service.clear_all().await?;
    Ok(Json(json!({ "removed": removed })))
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/documents",
                description: "Build or refresh the vector and summary indexes. Unchanged documents are skipped.",
                request_example: Some(json!({
                    "documents": [
                        { "id": "notes/rust.md", "text": "Rust is a systems language.", "metadata": { "file_name": "rust.md" } }
                    ]
                })),
            },
            CommandDescriptor {
                name: "query",
                method: "POST",
                path: "/query",
                description: "Answer a question from the vector index. Response returns { \"status\": string, \"answer\": string }.",
                request_example: Some(json!({
                    "question": "What is Rust?",
                    "top_k": 3,
                    "widen": true
                })),
            },
            CommandDescriptor {
                name: "summarize",
                method: "POST",
                path: "/summarize",
                description: "Summarise every indexed document with the chosen response mode.",
                request_example: Some(json!({
                    "mode": "tree_summarize",
                    "instruction": "Summarize the documents."
                })),
            },
            CommandDescriptor {
                name: "list_models",
                method: "GET",
                path: "/models",
                description: "List models installed in the daemon, the selection and install suggestions.",
                request_example: None,
            },
            CommandDescriptor {
                name: "select_model",
                method: "PUT",
                path: "/models/selected",
                description: "Select the model used for answers and summaries.",
                request_example: Some(json!({ "model": "llama2:latest" })),
            },
            CommandDescriptor {
                name: "health",
                method: "GET",
                path: "/health",
                description: "Report daemon liveness, ownership and loaded indexes.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return index cache counters.",
                request_example: None,
            },
            CommandDescriptor {
                name: "evict_index",
                method: "DELETE",
                path: "/indexes/:name",
                description: "Delete one persisted index so the next ingest rebuilds it.",
                request_example: None,
            },
            CommandDescriptor {
                name: "clear_indexes",
                method: "DELETE",
                path: "/indexes",
                description: "Delete every persisted index.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

impl From<ContextError> for AppError {
    fn from(inner: ContextError) -> Self {
        match inner {
            ContextError::EmptyModel | ContextError::UnknownModel(_) => {
                Self::BadRequest(inner.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
