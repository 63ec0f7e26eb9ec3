//! Enumeration of models installed in the daemon.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Well-known models offered as install suggestions (`ollama pull <name>`).
pub const SUGGESTED_MODELS: &[&str] = &[
    "llama2",
    "mistral",
    "codellama",
    "neural-chat",
    "starling-lm",
    "dolphin-phi",
    "orca-mini",
    "vicuna",
    "llama2-uncensored",
    "nous-hermes",
    "stable-beluga",
    "wizard-vicuna-uncensored",
];

/// Reasons a catalog request produced no data.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The daemon could not be reached in time.
    #[error("daemon unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    /// The daemon answered with a non-success status.
    #[error("unexpected status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    /// The body did not match `{ "models": [ { "name": .. } ] }`.
    #[error("malformed model listing: {0}")]
    Malformed(#[source] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

/// Client for the daemon's model listing.
pub struct ModelCatalog {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ModelCatalog {
    /// Build a catalog client for the daemon at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Installed model identifiers in daemon order; empty when the daemon cannot answer.
    pub async fn list_installed_models(&self) -> Vec<String> {
        match self.fetch().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "Listed installed models");
                models
            }
            Err(error) => {
                tracing::warn!(error = %error, "Model catalog unavailable");
                Vec::new()
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<String>, CatalogError> {
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(CatalogError::Unreachable)?;

        if !response.status().is_success() {
            return Err(CatalogError::UnexpectedStatus(response.status()));
        }

        let body: TagsResponse = response.json().await.map_err(CatalogError::Malformed)?;
        Ok(body.models.into_iter().map(|model| model.name).collect())
    }
}

/// Suggestions not yet present in `installed`; tags such as `llama2:latest` count as installed.
pub fn suggested_models(installed: &[String]) -> Vec<&'static str> {
    SUGGESTED_MODELS
        .iter()
        .copied()
        .filter(|candidate| {
            !installed.iter().any(|name| {
                name.as_str() == *candidate || name.split(':').next() == Some(*candidate)
            })
        })
        .collect()
}
