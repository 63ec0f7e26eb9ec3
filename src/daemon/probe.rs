//! Bounded-timeout liveness checks against the daemon's root endpoint.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// A check that answers "is the daemon reachable right now?".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Return `true` when the daemon answered successfully within `timeout`.
    async fn probe(&self, timeout: Duration) -> bool;
}

/// Probe issuing `GET {base_url}/` over HTTP.
pub struct HttpHealthProbe {
    client: Client,
    base_url: String,
}

impl HttpHealthProbe {
    /// Build a probe for the daemon at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Root URL probed for liveness.
    pub fn url(&self) -> String {
        format!("{}/", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LivenessProbe for HttpHealthProbe {
    async fn probe(&self, timeout: Duration) -> bool {
        match self.client.get(self.url()).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Liveness probe rejected");
                false
            }
            Err(error) => {
                tracing::trace!(error = %error, timeout_ms = timeout.as_millis() as u64, "Liveness probe failed");
                false
            }
        }
    }
}
