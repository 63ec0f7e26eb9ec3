use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::index::BuildConcurrency;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value that failed to parse.
        value: String,
    },
}

/// Runtime configuration for rustydoc.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the local Ollama daemon.
    pub ollama_url: String,
    /// Executable used to launch the daemon (`<command> serve`).
    pub ollama_command: String,
    /// Directory holding one sub-directory per named index.
    pub index_root: PathBuf,
    /// Generation model used for answers and summaries.
    pub llm_model: String,
    /// Embedding backend used for vector indexes.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Vector width produced by the offline hash provider.
    pub embedding_dimension: usize,
    /// Token budget per node.
    pub chunk_size: usize,
    /// Token overlap between adjacent nodes.
    pub chunk_overlap: usize,
    /// Default number of nodes retrieved per question.
    pub similarity_top_k: usize,
    /// Minimum similarity a retrieved node needs to reach the answer stage.
    pub similarity_cutoff: f32,
    /// Whether questions widen retrieval by default.
    pub hybrid_search: bool,
    /// Upper bound on the candidate count of a retrieval plan.
    pub max_candidates: usize,
    /// Character budget of a single generation prompt's context section.
    pub max_context_chars: usize,
    /// Serialisation policy for index builds.
    pub build_concurrency: BuildConcurrency,
    /// Timeout of a single liveness probe.
    pub liveness_timeout: Duration,
    /// Timeout of a model catalog request.
    pub catalog_timeout: Duration,
    /// How long a freshly spawned daemon may take to become reachable.
    pub startup_window: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping the daemon.
    pub stop_grace: Duration,
    /// Timeout of embedding and generation requests.
    pub request_timeout: Duration,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Deterministic offline hashing, useful without a daemon.
    Hash,
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://127.0.0.1:11434".into(),
            ollama_command: "ollama".into(),
            index_root: PathBuf::from("./index_data"),
            llm_model: "llama2".into(),
            embedding_provider: EmbeddingProvider::Ollama,
            embedding_model: "nomic-embed-text".into(),
            embedding_dimension: 384,
            chunk_size: 1000,
            chunk_overlap: 200,
            similarity_top_k: 3,
            similarity_cutoff: 0.7,
            hybrid_search: true,
            max_candidates: 100,
            max_context_chars: 12_000,
            build_concurrency: BuildConcurrency::PerName,
            liveness_timeout: Duration::from_millis(2000),
            catalog_timeout: Duration::from_millis(2000),
            startup_window: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            server_port: None,
        }
    }
}

impl Config {
    /// Load `.env` (when present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        tracing::debug!(
            ollama_url = %config.ollama_url,
            index_root = %config.index_root.display(),
            llm_model = %config.llm_model,
            embedding_provider = ?config.embedding_provider,
            embedding_model = %config.embedding_model,
            build_concurrency = ?config.build_concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Blank values count as unset so an empty line in `.env` keeps the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            ollama_url: get("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            ollama_command: get("OLLAMA_COMMAND").unwrap_or(defaults.ollama_command),
            index_root: get("INDEX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_root),
            llm_model: get("LLM_MODEL").unwrap_or(defaults.llm_model),
            embedding_provider: parse_with(
                "EMBEDDING_PROVIDER",
                get("EMBEDDING_PROVIDER"),
                defaults.embedding_provider,
                |value| value.parse().ok(),
            )?,
            embedding_model: get("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_dimension: parse_or(
                "EMBEDDING_DIMENSION",
                get("EMBEDDING_DIMENSION"),
                defaults.embedding_dimension,
            )?,
            chunk_size: parse_or("CHUNK_SIZE", get("CHUNK_SIZE"), defaults.chunk_size)?,
            chunk_overlap: parse_or("CHUNK_OVERLAP", get("CHUNK_OVERLAP"), defaults.chunk_overlap)?,
            similarity_top_k: parse_or(
                "SIMILARITY_TOP_K",
                get("SIMILARITY_TOP_K"),
                defaults.similarity_top_k,
            )?,
            similarity_cutoff: parse_with(
                "SIMILARITY_CUTOFF",
                get("SIMILARITY_CUTOFF"),
                defaults.similarity_cutoff,
                |value| {
                    value
                        .parse::<f32>()
                        .ok()
                        .filter(|cutoff| (0.0..=1.0).contains(cutoff))
                },
            )?,
            hybrid_search: parse_with(
                "HYBRID_SEARCH",
                get("HYBRID_SEARCH"),
                defaults.hybrid_search,
                parse_flag,
            )?,
            max_candidates: parse_or(
                "MAX_CANDIDATES",
                get("MAX_CANDIDATES"),
                defaults.max_candidates,
            )?,
            max_context_chars: parse_or(
                "MAX_CONTEXT_CHARS",
                get("MAX_CONTEXT_CHARS"),
                defaults.max_context_chars,
            )?,
            build_concurrency: parse_with(
                "INDEX_BUILD_CONCURRENCY",
                get("INDEX_BUILD_CONCURRENCY"),
                defaults.build_concurrency,
                |value| value.parse().ok(),
            )?,
            liveness_timeout: millis_or(
                "LIVENESS_TIMEOUT_MS",
                get("LIVENESS_TIMEOUT_MS"),
                defaults.liveness_timeout,
            )?,
            catalog_timeout: millis_or(
                "CATALOG_TIMEOUT_MS",
                get("CATALOG_TIMEOUT_MS"),
                defaults.catalog_timeout,
            )?,
            startup_window: secs_or(
                "STARTUP_WINDOW_SECS",
                get("STARTUP_WINDOW_SECS"),
                defaults.startup_window,
            )?,
            stop_grace: secs_or("STOP_GRACE_SECS", get("STOP_GRACE_SECS"), defaults.stop_grace)?,
            request_timeout: secs_or(
                "REQUEST_TIMEOUT_SECS",
                get("REQUEST_TIMEOUT_SECS"),
                defaults.request_timeout,
            )?,
            server_port: get("SERVER_PORT")
                .map(|value| {
                    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                        key: "SERVER_PORT".into(),
                        value,
                    })
                })
                .transpose()?,
        })
    }
}

fn parse_with<T, P>(key: &str, raw: Option<String>, default: T, parse: P) -> Result<T, ConfigError>
where
    P: FnOnce(&str) -> Option<T>,
{
    match raw {
        None => Ok(default),
        Some(value) => parse(value.trim()).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    parse_with(key, raw, default, |value| value.parse().ok())
}

fn millis_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    parse_with(key, raw, default, |value| {
        value.parse().ok().map(Duration::from_millis)
    })
}

fn secs_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    parse_with(key, raw, default, |value| {
        value.parse().ok().map(Duration::from_secs)
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
