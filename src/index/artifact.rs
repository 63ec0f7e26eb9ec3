//! In-memory form of a named index and the reference-aware refresh that keeps it current.

use crate::embedding::EmbeddingClient;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use super::splitter::NodeSplitter;
use super::types::{DocRef, Document, IndexError, IndexKind, IndexName, Node};

/// On-disk format revision written into every manifest.
pub const FORMAT_VERSION: u32 = 1;

const EMBEDDING_BATCH_SIZE: usize = 32;

/// Contents of `manifest.json`; its presence marks a committed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format revision.
    pub format_version: u32,
    /// Kind of index.
    pub kind: IndexKind,
    /// Model that produced the node embeddings (vector indexes only).
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Number of documents referenced.
    pub document_count: usize,
    /// Number of nodes stored.
    pub node_count: usize,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last refresh.
    pub updated_at: String,
}

/// A loaded or freshly built index.
#[derive(Debug, Clone)]
pub struct IndexArtifact {
    pub(crate) name: IndexName,
    pub(crate) path: PathBuf,
    pub(crate) manifest: Manifest,
    pub(crate) nodes: Vec<Node>,
    pub(crate) doc_refs: BTreeMap<String, DocRef>,
}

impl IndexArtifact {
    pub(crate) fn empty(
        name: IndexName,
        path: PathBuf,
        kind: IndexKind,
        embedding_model: Option<String>,
    ) -> Self {
        let now = timestamp();
        Self {
            name,
            path,
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                kind,
                embedding_model,
                document_count: 0,
                node_count: 0,
                created_at: now.clone(),
                updated_at: now,
            },
            nodes: Vec::new(),
            doc_refs: BTreeMap::new(),
        }
    }

    /// Logical name.
    pub fn name(&self) -> &IndexName {
        &self.name
    }

    /// Index kind.
    pub fn kind(&self) -> IndexKind {
        self.manifest.kind
    }

    /// Directory the artifact is persisted in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Manifest describing the artifact.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether no node is stored.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Identities of every incorporated document.
    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.doc_refs.keys().map(String::as_str)
    }

    /// Whether the document has been incorporated.
    pub fn contains_document(&self, doc_id: &str) -> bool {
        self.doc_refs.contains_key(doc_id)
    }

    /// Width of the stored embeddings, if any.
    pub fn embedding_dimension(&self) -> Option<usize> {
        self.nodes
            .iter()
            .find_map(|node| node.embedding.as_ref().map(Vec::len))
    }

    /// Check internal consistency; the error text explains the first violation found.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let manifest = &self.manifest;
        if manifest.format_version != FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {}",
                manifest.format_version
            ));
        }
        if manifest.node_count != self.nodes.len() {
            return Err(format!(
                "manifest lists {} nodes, found {}",
                manifest.node_count,
                self.nodes.len()
            ));
        }
        if manifest.document_count != self.doc_refs.len() {
            return Err(format!(
                "manifest lists {} documents, found {}",
                manifest.document_count,
                self.doc_refs.len()
            ));
        }

        let node_ids: HashSet<&str> = self.nodes.iter().map(|node| node.id.as_str()).collect();
        let referenced: usize = self.doc_refs.values().map(|r| r.node_ids.len()).sum();
        if node_ids.len() != self.nodes.len() || referenced != self.nodes.len() {
            return Err("node references are inconsistent".into());
        }
        if let Some((doc_id, _)) = self
            .doc_refs
            .iter()
            .find(|(_, r)| r.node_ids.iter().any(|id| !node_ids.contains(id.as_str())))
        {
            return Err(format!("document '{doc_id}' references a missing node"));
        }

        if manifest.kind == IndexKind::Vector {
            let dimension = self.embedding_dimension();
            let consistent = self.nodes.iter().all(|node| {
                node.embedding.as_ref().map(Vec::len) == dimension && dimension != Some(0)
            });
            if !consistent {
                return Err("vector nodes are missing embeddings or differ in width".into());
            }
        }
        Ok(())
    }
}

/// What a build or refresh did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Documents seen for the first time.
    pub inserted: usize,
    /// Known documents whose content changed.
    pub updated: usize,
    /// Known documents skipped because their content is unchanged.
    pub unchanged: usize,
    /// Nodes that received a fresh embedding.
    pub nodes_embedded: usize,
}

impl RefreshSummary {
    /// Whether the artifact was modified.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// Turns documents into nodes and merges them into artifacts.
#[derive(Clone)]
pub struct ArtifactBuilder {
    splitter: NodeSplitter,
    embedder: Arc<dyn EmbeddingClient>,
}

struct StagedDocument<'a> {
    document: &'a Document,
    content_hash: String,
    chunks: Vec<String>,
}

impl ArtifactBuilder {
    /// Create a builder from a splitter and an embedding backend.
    pub fn new(splitter: NodeSplitter, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { splitter, embedder }
    }

    /// Model name recorded in vector manifests.
    pub fn embedding_model(&self) -> &str {
        self.embedder.model_name()
    }

    /// Build a new artifact from scratch.
    pub async fn build(
        &self,
        name: IndexName,
        path: PathBuf,
        kind: IndexKind,
        documents: &[Document],
    ) -> Result<(IndexArtifact, RefreshSummary), IndexError> {
        let model = (kind == IndexKind::Vector).then(|| self.embedding_model().to_string());
        let mut artifact = IndexArtifact::empty(name, path, kind, model);
        let summary = self.refresh(&mut artifact, documents).await?;
        Ok((artifact, summary))
    }

    /// Merge `documents` into `artifact`.
    ///
    /// Unchanged documents are skipped, changed ones replace their previous nodes. The artifact
    /// is only mutated after every split and embedding call succeeded.
    pub async fn refresh(
        &self,
        artifact: &mut IndexArtifact,
        documents: &[Document],
    ) -> Result<RefreshSummary, IndexError> {
        let kind = artifact.kind();
        if kind == IndexKind::Vector {
            self.check_embedding_model(artifact)?;
        }

        let mut summary = RefreshSummary::default();
        let staged = self.stage(artifact, documents, &mut summary);
        if staged.is_empty() {
            return Ok(summary);
        }

        let texts: Vec<String> = staged
            .iter()
            .flat_map(|doc| doc.chunks.iter().cloned())
            .collect();
        let mut embeddings = match kind {
            IndexKind::Vector => self.embed_all(texts, artifact.name()).await?.into_iter(),
            IndexKind::Summary => Vec::new().into_iter(),
        };

        let mut retired: HashSet<String> = HashSet::new();
        let mut new_nodes = Vec::new();
        for doc in &staged {
            if let Some(previous) = artifact.doc_refs.get(&doc.document.id) {
                retired.extend(previous.node_ids.iter().cloned());
            }
            let mut node_ids = Vec::with_capacity(doc.chunks.len());
            for chunk in &doc.chunks {
                let node = Node {
                    id: Uuid::new_v4().to_string(),
                    doc_id: doc.document.id.clone(),
                    text: chunk.clone(),
                    embedding: embeddings.next(),
                    metadata: doc.document.metadata.clone(),
                };
                node_ids.push(node.id.clone());
                new_nodes.push(node);
            }
            if doc.chunks.is_empty() {
                tracing::debug!(doc_id = %doc.document.id, "Document produced no nodes");
            }
            artifact.doc_refs.insert(
                doc.document.id.clone(),
                DocRef {
                    content_hash: doc.content_hash.clone(),
                    node_ids,
                },
            );
        }

        if kind == IndexKind::Vector {
            summary.nodes_embedded = new_nodes.len();
        }
        artifact.nodes.retain(|node| !retired.contains(&node.id));
        artifact.nodes.extend(new_nodes);
        artifact.manifest.node_count = artifact.nodes.len();
        artifact.manifest.document_count = artifact.doc_refs.len();
        artifact.manifest.updated_at = timestamp();

        tracing::debug!(
            index = %artifact.name(),
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            nodes_embedded = summary.nodes_embedded,
            "Merged documents into index"
        );
        Ok(summary)
    }

    fn stage<'a>(
        &self,
        artifact: &IndexArtifact,
        documents: &'a [Document],
        summary: &mut RefreshSummary,
    ) -> Vec<StagedDocument<'a>> {
        // The last occurrence of a repeated id wins.
        let last_index: HashMap<&str, usize> = documents
            .iter()
            .enumerate()
            .map(|(idx, doc)| (doc.id.as_str(), idx))
            .collect();

        let mut staged = Vec::new();
        for (idx, document) in documents.iter().enumerate() {
            if last_index.get(document.id.as_str()) != Some(&idx) {
                continue;
            }
            let content_hash = document.content_hash();
            match artifact.doc_refs.get(&document.id) {
                Some(existing) if existing.content_hash == content_hash => {
                    summary.unchanged += 1;
                    continue;
                }
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
            staged.push(StagedDocument {
                document,
                content_hash,
                chunks: self.splitter.split(&document.text),
            });
        }
        staged
    }

    async fn embed_all(
        &self,
        texts: Vec<String>,
        name: &IndexName,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
            let expected = batch.len();
            let embedded = self.embedder.generate_embeddings(batch.to_vec()).await?;
            if embedded.len() != expected {
                return Err(IndexError::Build {
                    name: name.to_string(),
                    reason: format!(
                        "embedding backend returned {} vectors for {expected} nodes",
                        embedded.len()
                    ),
                });
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    fn check_embedding_model(&self, artifact: &IndexArtifact) -> Result<(), IndexError> {
        let current = self.embedding_model();
        match artifact.manifest.embedding_model.as_deref() {
            Some(stored) if stored != current => Err(IndexError::Build {
                name: artifact.name().to_string(),
                reason: format!(
                    "index was embedded with '{stored}' but the current model is '{current}'; evict it to rebuild"
                ),
            }),
            _ => Ok(()),
        }
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClientError, HashEmbeddingClient};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingEmbedder {
        inner: HashEmbeddingClient,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmbeddingClient for RecordingEmbedder {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            self.inner.generate_embeddings(texts).await
        }

        fn model_name(&self) -> &str {
            "recording"
        }
    }

    fn builder() -> (ArtifactBuilder, Arc<RecordingEmbedder>) {
        let embedder = Arc::new(RecordingEmbedder {
            inner: HashEmbeddingClient::new(8),
            seen: Mutex::new(Vec::new()),
        });
        let builder = ArtifactBuilder::new(
            NodeSplitter::whitespace(4, 0).expect("splitter"),
            embedder.clone(),
        );
        (builder, embedder)
    }

    #[tokio::test]
    async fn build_embeds_every_node() {
        let (builder, embedder) = builder();
        let docs = vec![Document::new("a", "one two three four five")];
        let (artifact, summary) = builder
            .build(IndexName::vector(), PathBuf::from("/tmp/x"), IndexKind::Vector, &docs)
            .await
            .expect("build");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.nodes_embedded, 2);
        assert_eq!(artifact.nodes().len(), 2);
        assert_eq!(embedder.seen.lock().unwrap().len(), 2);
        assert_eq!(artifact.manifest().embedding_model.as_deref(), Some("recording"));
        artifact.validate().expect("valid artifact");
    }

    #[tokio::test]
    async fn refresh_skips_unchanged_and_replaces_changed() {
        let (builder, embedder) = builder();
        let (mut artifact, _) = builder
            .build(
                IndexName::vector(),
                PathBuf::from("/tmp/x"),
                IndexKind::Vector,
                &[Document::new("a", "alpha beta"), Document::new("b", "gamma")],
            )
            .await
            .expect("build");
        embedder.seen.lock().unwrap().clear();

        let summary = builder
            .refresh(
                &mut artifact,
                &[
                    Document::new("a", "alpha beta"),
                    Document::new("b", "gamma delta"),
                    Document::new("c", "epsilon"),
                ],
            )
            .await
            .expect("refresh");

        assert_eq!(
            summary,
            RefreshSummary {
                inserted: 1,
                updated: 1,
                unchanged: 1,
                nodes_embedded: 2
            }
        );
        assert_eq!(*embedder.seen.lock().unwrap(), vec!["gamma delta", "epsilon"]);
        let texts: Vec<&str> = artifact.nodes().iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["alpha beta", "gamma delta", "epsilon"]);
        artifact.validate().expect("valid artifact");
    }

    #[tokio::test]
    async fn summary_artifacts_do_not_embed() {
        let (builder, embedder) = builder();
        let (artifact, summary) = builder
            .build(
                IndexName::summary(),
                PathBuf::from("/tmp/x"),
                IndexKind::Summary,
                &[Document::new("a", "one two three")],
            )
            .await
            .expect("build");

        assert_eq!(summary.nodes_embedded, 0);
        assert!(embedder.seen.lock().unwrap().is_empty());
        assert!(artifact.nodes().iter().all(|node| node.embedding.is_none()));
        assert!(artifact.manifest().embedding_model.is_none());
        artifact.validate().expect("valid artifact");
    }

    #[tokio::test]
    async fn repeated_ids_keep_the_last_version() {
        let (builder, _) = builder();
        let (artifact, summary) = builder
            .build(
                IndexName::summary(),
                PathBuf::from("/tmp/x"),
                IndexKind::Summary,
                &[Document::new("a", "first"), Document::new("a", "second")],
            )
            .await
            .expect("build");
        assert_eq!(summary.inserted, 1);
        assert_eq!(artifact.nodes()[0].text, "second");
    }

    #[tokio::test]
    async fn embedding_model_change_is_rejected() {
        let (builder, _) = builder();
        let (mut artifact, _) = builder
            .build(
                IndexName::vector(),
                PathBuf::from("/tmp/x"),
                IndexKind::Vector,
                &[Document::new("a", "alpha")],
            )
            .await
            .expect("build");
        artifact.manifest.embedding_model = Some("other-model".into());

        let error = builder
            .refresh(&mut artifact, &[Document::new("b", "beta")])
            .await
            .expect_err("model mismatch");
        assert!(error.to_string().contains("evict"));
        assert!(!artifact.contains_document("b"));
    }
}
