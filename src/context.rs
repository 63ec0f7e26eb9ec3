//! Session context tying the daemon, index cache and query layer together.
//!
//! Everything a front end needs lives in one [`AppContext`]; there is no process-wide state.
//! The HTTP router and the CLI both drive it through the same operations.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::daemon::{
    HttpHealthProbe, LivenessProbe, ModelCatalog, ServiceStatus, ServiceSupervisor,
    SupervisorSettings, suggested_models,
};
use crate::embedding::{EmbeddingClient, EmbeddingClientError, embedding_client};
use crate::generation::{GenerationClient, GenerationClientError, OllamaGenerationClient};
use crate::index::{
    ArtifactBuilder, Document, IndexArtifact, IndexCache, IndexError, IndexName, NodeSplitter,
    SplitError,
};
use crate::metrics::{IndexMetrics, MetricsSnapshot};
use crate::query::{QueryAnswer, QueryEngine, QueryPlan, QueryPlanBuilder, ResponseMode};

/// Instruction used when a summary is requested without one.
pub const DEFAULT_SUMMARY_INSTRUCTION: &str = "Summarize the documents.";

/// Errors raised while assembling or driving the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Embedding backend could not be configured.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Generation backend could not be configured.
    #[error(transparent)]
    Generation(#[from] GenerationClientError),
    /// Node splitter could not be configured.
    #[error(transparent)]
    Split(#[from] SplitError),
    /// Index storage failed.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Model name was blank.
    #[error("model name must not be empty")]
    EmptyModel,
    /// The daemon reported its models and the requested one is not among them.
    #[error("model '{0}' is not installed; run `ollama pull {0}`")]
    UnknownModel(String),
}

/// Mutable per-session state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Model used for answers and summaries.
    pub selected_model: String,
    /// Models last reported by the daemon.
    pub installed_models: Vec<String>,
    /// Vector index produced by the last ingest.
    pub vector_index: Option<Arc<IndexArtifact>>,
    /// Summary index produced by the last ingest.
    pub summary_index: Option<Arc<IndexArtifact>>,
    /// Identities of documents ingested during this session.
    pub processed_documents: BTreeSet<String>,
}

/// Result of [`AppContext::ingest`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    /// Documents offered.
    pub documents: usize,
    /// Whether the vector index is available afterwards.
    pub vector_ready: bool,
    /// Whether the summary index is available afterwards.
    pub summary_ready: bool,
    /// Node count of the vector index.
    pub vector_nodes: usize,
    /// Node count of the summary index.
    pub summary_nodes: usize,
}

/// Model listing with install suggestions.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelListing {
    /// Models installed in the daemon.
    pub installed: Vec<String>,
    /// Currently selected model.
    pub selected: String,
    /// Well-known models not yet installed.
    pub suggested: Vec<&'static str>,
}

/// Snapshot returned by [`AppContext::health`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    /// Whether the daemon answered the liveness probe.
    pub daemon_alive: bool,
    /// Whether this process spawned the daemon.
    pub owns_daemon: bool,
    /// Currently selected model.
    pub selected_model: String,
    /// Whether a vector index is loaded.
    pub vector_index: bool,
    /// Whether a summary index is loaded.
    pub summary_index: bool,
    /// Documents ingested this session.
    pub processed_documents: usize,
}

/// Explicit application context shared by the HTTP and CLI front ends.
pub struct AppContext {
    config: Config,
    supervisor: ServiceSupervisor,
    catalog: ModelCatalog,
    cache: IndexCache,
    planner: QueryPlanBuilder,
    engine: QueryEngine,
    session: RwLock<SessionState>,
}

impl AppContext {
    /// Assemble a context talking to the daemon named in `config`.
    pub fn new(config: Config) -> Result<Self, ContextError> {
        let probe: Arc<dyn LivenessProbe> = Arc::new(HttpHealthProbe::new(config.ollama_url.clone()));
        let embedder = embedding_client(&config)?;
        let generator: Arc<dyn GenerationClient> = Arc::new(OllamaGenerationClient::new(
            config.ollama_url.clone(),
            config.request_timeout,
        )?);
        Self::with_components(config, probe, embedder, generator)
    }

    /// Assemble a context from explicit backends.
    pub fn with_components(
        config: Config,
        probe: Arc<dyn LivenessProbe>,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
    ) -> Result<Self, ContextError> {
        let supervisor = ServiceSupervisor::new(probe, supervisor_settings(&config));
        let catalog = ModelCatalog::new(config.ollama_url.clone(), config.catalog_timeout);
        let splitter = NodeSplitter::new(config.chunk_size, config.chunk_overlap)?;
        let cache = IndexCache::open(
            config.index_root.clone(),
            ArtifactBuilder::new(splitter, embedder.clone()),
            config.build_concurrency,
            Arc::new(IndexMetrics::new()),
        );
        let planner = QueryPlanBuilder::new(config.similarity_cutoff, config.max_candidates);
        let engine = QueryEngine::new(
            embedder,
            generator,
            config.llm_model.clone(),
            config.max_context_chars,
        );
        let session = SessionState {
            selected_model: config.llm_model.clone(),
            ..SessionState::default()
        };

        Ok(Self {
            config,
            supervisor,
            catalog,
            cache,
            planner,
            engine,
            session: RwLock::new(session),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying index cache.
    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Make sure the daemon is reachable, spawning it when needed, and refresh the model list.
    pub async fn connect_daemon(&self) -> ServiceStatus {
        let status = self.supervisor.start().await;
        if status.is_available() {
            self.installed_models().await;
        } else {
            tracing::warn!(%status, "Inference daemon unavailable");
        }
        status
    }

    /// Query the daemon for installed models and remember them.
    pub async fn installed_models(&self) -> Vec<String> {
        let models = self.catalog.list_installed_models().await;
        self.session.write().await.installed_models = models.clone();
        models
    }

    /// Installed models, the selection and install suggestions.
    pub async fn model_listing(&self) -> ModelListing {
        let installed = self.installed_models().await;
        let suggested = suggested_models(&installed);
        ModelListing {
            installed,
            selected: self.session.read().await.selected_model.clone(),
            suggested,
        }
    }

    /// Select the model used for answers and summaries.
    ///
    /// When the daemon has reported its models the choice must be one of them; otherwise any
    /// non-empty name is accepted.
    pub async fn select_model(&self, model: &str) -> Result<(), ContextError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ContextError::EmptyModel);
        }
        let mut session = self.session.write().await;
        if !session.installed_models.is_empty()
            && !session.installed_models.iter().any(|name| name == model)
        {
            return Err(ContextError::UnknownModel(model.to_string()));
        }
        session.selected_model = model.to_string();
        self.engine.set_model(model);
        tracing::info!(model, "Selected model");
        Ok(())
    }

    /// Build or refresh both default indexes from `documents`.
    pub async fn ingest(&self, documents: Vec<Document>) -> IngestReport {
        let vector = self.cache.vector_index(&documents).await;
        let summary = self.cache.summary_index(&documents).await;

        let report = IngestReport {
            documents: documents.len(),
            vector_ready: vector.is_some(),
            summary_ready: summary.is_some(),
            vector_nodes: vector.as_ref().map_or(0, |index| index.nodes().len()),
            summary_nodes: summary.as_ref().map_or(0, |index| index.nodes().len()),
        };

        let mut session = self.session.write().await;
        session
            .processed_documents
            .extend(documents.into_iter().map(|document| document.id));
        if vector.is_some() {
            session.vector_index = vector;
        }
        if summary.is_some() {
            session.summary_index = summary;
        }
        tracing::info!(
            documents = report.documents,
            vector_nodes = report.vector_nodes,
            summary_nodes = report.summary_nodes,
            "Ingest finished"
        );
        report
    }

    /// Answer `question` from the vector index.
    ///
    /// `top_k` and `widen` default to the configured `SIMILARITY_TOP_K` and `HYBRID_SEARCH`.
    pub async fn ask(&self, question: &str, top_k: Option<usize>, widen: Option<bool>) -> QueryAnswer {
        let artifact = self.current_vector_index().await;
        let plan = self
            .planner
            .build_retrieval_plan(
                artifact.as_ref(),
                top_k.unwrap_or(self.config.similarity_top_k),
                widen.unwrap_or(self.config.hybrid_search),
            )
            .map(QueryPlan::from);
        self.engine.execute(plan.as_ref(), question).await
    }

    /// Summarise the summary index, optionally steered by `instruction`.
    pub async fn summarize(
        &self,
        mode: Option<ResponseMode>,
        instruction: Option<&str>,
    ) -> QueryAnswer {
        let artifact = self.current_summary_index().await;
        let plan = self
            .planner
            .build_summary_plan(artifact.as_ref(), mode.unwrap_or_default())
            .map(QueryPlan::from);
        let instruction = instruction
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(DEFAULT_SUMMARY_INSTRUCTION);
        self.engine.execute(plan.as_ref(), instruction).await
    }

    /// Delete the persisted index `name` and forget it for this session.
    pub async fn evict(&self, name: &IndexName) -> Result<bool, ContextError> {
        let removed = self.cache.evict(name).await?;
        let mut session = self.session.write().await;
        if session
            .vector_index
            .as_ref()
            .is_some_and(|index| index.name() == name)
        {
            session.vector_index = None;
        }
        if session
            .summary_index
            .as_ref()
            .is_some_and(|index| index.name() == name)
        {
            session.summary_index = None;
        }
        Ok(removed)
    }

    /// Delete every persisted index and reset the session's document state.
    pub async fn clear_all(&self) -> Result<usize, ContextError> {
        let removed = self.cache.evict_all().await?;
        let mut session = self.session.write().await;
        session.vector_index = None;
        session.summary_index = None;
        session.processed_documents.clear();
        Ok(removed)
    }

    /// Current daemon and session status.
    pub async fn health(&self) -> HealthReport {
        let daemon_alive = self.supervisor.is_healthy().await;
        let owns_daemon = self.supervisor.owns_daemon().await;
        let session = self.session.read().await;
        HealthReport {
            daemon_alive,
            owns_daemon,
            selected_model: session.selected_model.clone(),
            vector_index: session.vector_index.is_some(),
            summary_index: session.summary_index.is_some(),
            processed_documents: session.processed_documents.len(),
        }
    }

    /// Index cache counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.cache.metrics().snapshot()
    }

    /// Stop the daemon if this context spawned it.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
    }

    async fn current_vector_index(&self) -> Option<Arc<IndexArtifact>> {
        if let Some(index) = self.session.read().await.vector_index.clone() {
            return Some(index);
        }
        let loaded = self.cache.vector_index(&[]).await;
        if loaded.is_some() {
            self.session.write().await.vector_index = loaded.clone();
        }
        loaded
    }

    async fn current_summary_index(&self) -> Option<Arc<IndexArtifact>> {
        if let Some(index) = self.session.read().await.summary_index.clone() {
            return Some(index);
        }
        let loaded = self.cache.summary_index(&[]).await;
        if loaded.is_some() {
            self.session.write().await.summary_index = loaded.clone();
        }
        loaded
    }
}

fn supervisor_settings(config: &Config) -> SupervisorSettings {
    SupervisorSettings {
        command: config.ollama_command.clone(),
        probe_timeout: config.liveness_timeout,
        startup_window: config.startup_window,
        stop_grace: config.stop_grace,
        ..SupervisorSettings::default()
    }
}
