use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing index cache activity.
#[derive(Default)]
pub struct IndexMetrics {
    artifacts_built: AtomicU64,
    artifacts_refreshed: AtomicU64,
    documents_processed: AtomicU64,
    nodes_embedded: AtomicU64,
    failures: AtomicU64,
}

impl IndexMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a from-scratch build.
    pub fn record_build(&self, documents: u64, nodes_embedded: u64) {
        self.artifacts_built.fetch_add(1, Ordering::Relaxed);
        self.record_work(documents, nodes_embedded);
    }

    /// Record a refresh that changed the artifact.
    pub fn record_refresh(&self, documents: u64, nodes_embedded: u64) {
        self.artifacts_refreshed.fetch_add(1, Ordering::Relaxed);
        self.record_work(documents, nodes_embedded);
    }

    /// Record an absorbed build or load failure.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_work(&self, documents: u64, nodes_embedded: u64) {
        self.documents_processed
            .fetch_add(documents, Ordering::Relaxed);
        self.nodes_embedded
            .fetch_add(nodes_embedded, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            artifacts_built: self.artifacts_built.load(Ordering::Relaxed),
            artifacts_refreshed: self.artifacts_refreshed.load(Ordering::Relaxed),
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            nodes_embedded: self.nodes_embedded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of index counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Artifacts built from scratch since startup.
    pub artifacts_built: u64,
    /// Refreshes that merged new or changed documents.
    pub artifacts_refreshed: u64,
    /// Documents split into nodes (new or changed only).
    pub documents_processed: u64,
    /// Nodes that received an embedding.
    pub nodes_embedded: u64,
    /// Absorbed build/load failures.
    pub failures: u64,
}
