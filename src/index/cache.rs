//! Persistent cache of named index artifacts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};

use super::artifact::{ArtifactBuilder, IndexArtifact, RefreshSummary};
use super::storage;
use super::types::{Document, IndexError, IndexKind, IndexName};
use crate::metrics::IndexMetrics;

/// How concurrent builds are serialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildConcurrency {
    /// Callers for the same name wait for each other; different names proceed in parallel.
    #[default]
    PerName,
    /// Every build waits on one cache-wide lock.
    Global,
}

impl FromStr for BuildConcurrency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per_name" | "per-name" => Ok(Self::PerName),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown build concurrency '{other}'")),
        }
    }
}

/// Loads, builds, refreshes and evicts artifacts under one persistence root.
///
/// Locks are always taken in the order root, global, name.
pub struct IndexCache {
    root: PathBuf,
    builder: ArtifactBuilder,
    concurrency: BuildConcurrency,
    metrics: Arc<IndexMetrics>,
    root_lock: RwLock<()>,
    global_lock: Mutex<()>,
    name_locks: StdMutex<HashMap<IndexName, Arc<Mutex<()>>>>,
}

impl IndexCache {
    /// Create a cache rooted at `root`; the directory is created lazily.
    pub fn open(
        root: impl Into<PathBuf>,
        builder: ArtifactBuilder,
        concurrency: BuildConcurrency,
        metrics: Arc<IndexMetrics>,
    ) -> Self {
        Self {
            root: root.into(),
            builder,
            concurrency,
            metrics,
            root_lock: RwLock::new(()),
            global_lock: Mutex::new(()),
            name_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Persistence root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared build counters.
    pub fn metrics(&self) -> &Arc<IndexMetrics> {
        &self.metrics
    }

    /// Load, refresh or build the artifact `name`.
    ///
    /// Returns `None` when nothing is stored and no documents were given, and when loading or
    /// building fails. Failures are logged and counted, never propagated.
    pub async fn get_or_build(
        &self,
        documents: &[Document],
        name: &IndexName,
        kind: IndexKind,
    ) -> Option<Arc<IndexArtifact>> {
        let _root = self.root_lock.read().await;
        let _global = match self.concurrency {
            BuildConcurrency::Global => Some(self.global_lock.lock().await),
            BuildConcurrency::PerName => None,
        };
        let name_lock = self.name_lock(name);
        let _name = name_lock.lock().await;

        match self.load_or_build(documents, name, kind).await {
            Ok(artifact) => artifact.map(Arc::new),
            Err(error) => {
                self.metrics.record_failure();
                match &error {
                    IndexError::Load { .. } => {
                        tracing::error!(index = %name, error = %error, "IndexLoadFailure");
                    }
                    _ => {
                        tracing::error!(index = %name, error = %error, "IndexBuildFailure");
                    }
                }
                None
            }
        }
    }

    /// [`get_or_build`](Self::get_or_build) for the default vector index.
    pub async fn vector_index(&self, documents: &[Document]) -> Option<Arc<IndexArtifact>> {
        self.get_or_build(documents, &IndexName::vector(), IndexKind::Vector)
            .await
    }

    /// [`get_or_build`](Self::get_or_build) for the default summary index.
    pub async fn summary_index(&self, documents: &[Document]) -> Option<Arc<IndexArtifact>> {
        self.get_or_build(documents, &IndexName::summary(), IndexKind::Summary)
            .await
    }

    /// Delete the persisted artifact `name`; returns whether one existed.
    pub async fn evict(&self, name: &IndexName) -> Result<bool, IndexError> {
        let _root = self.root_lock.read().await;
        let name_lock = self.name_lock(name);
        let _name = name_lock.lock().await;

        let removed = storage::remove(&self.root, name).await?;
        tracing::info!(index = %name, removed, "Evicted index");
        Ok(removed)
    }

    /// Delete every persisted artifact, leaving an empty root.
    pub async fn evict_all(&self) -> Result<usize, IndexError> {
        let _root = self.root_lock.write().await;
        let removed = storage::remove_all(&self.root).await?;
        tracing::info!(root = %self.root.display(), removed, "Cleared index storage");
        Ok(removed)
    }

    fn name_lock(&self, name: &IndexName) -> Arc<Mutex<()>> {
        let mut locks = self
            .name_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.clone()).or_default().clone()
    }

    async fn load_or_build(
        &self,
        documents: &[Document],
        name: &IndexName,
        kind: IndexKind,
    ) -> Result<Option<IndexArtifact>, IndexError> {
        storage::recover(&self.root, name).await?;

        match storage::load(&self.root, name).await? {
            Some(mut artifact) => {
                self.check_compatible(&artifact, kind)?;
                if documents.is_empty() {
                    tracing::debug!(index = %name, nodes = artifact.nodes().len(), "Loaded index");
                    return Ok(Some(artifact));
                }
                let summary = self.builder.refresh(&mut artifact, documents).await?;
                if summary.changed() {
                    storage::persist(&self.root, &artifact).await?;
                    self.record(&summary, true);
                    tracing::info!(
                        index = %name,
                        inserted = summary.inserted,
                        updated = summary.updated,
                        unchanged = summary.unchanged,
                        "Refreshed index"
                    );
                } else {
                    tracing::debug!(index = %name, unchanged = summary.unchanged, "Index up to date");
                }
                Ok(Some(artifact))
            }
            None if documents.is_empty() => {
                tracing::debug!(index = %name, "No stored index and no documents");
                Ok(None)
            }
            None => {
                let path = storage::artifact_dir(&self.root, name);
                let (artifact, summary) = self
                    .builder
                    .build(name.clone(), path, kind, documents)
                    .await?;
                storage::persist(&self.root, &artifact).await?;
                self.record(&summary, false);
                tracing::info!(
                    index = %name,
                    kind = %kind,
                    documents = summary.inserted,
                    nodes = artifact.nodes().len(),
                    "Built index"
                );
                Ok(Some(artifact))
            }
        }
    }

    fn check_compatible(&self, artifact: &IndexArtifact, kind: IndexKind) -> Result<(), IndexError> {
        let mismatch = |reason: String| IndexError::Load {
            name: artifact.name().to_string(),
            reason,
        };
        if artifact.kind() != kind {
            return Err(mismatch(format!(
                "stored index is a {} index, not a {kind} index; evict it to rebuild",
                artifact.kind()
            )));
        }
        if kind == IndexKind::Vector {
            let current = self.builder.embedding_model();
            if let Some(stored) = artifact.manifest().embedding_model.as_deref()
                && stored != current
            {
                return Err(mismatch(format!(
                    "index was embedded with '{stored}' but the current model is '{current}'; evict it to rebuild"
                )));
            }
        }
        Ok(())
    }

    fn record(&self, summary: &RefreshSummary, refresh: bool) {
        let documents = (summary.inserted + summary.updated) as u64;
        let nodes = summary.nodes_embedded as u64;
        if refresh {
            self.metrics.record_refresh(documents, nodes);
        } else {
            self.metrics.record_build(documents, nodes);
        }
    }
}
