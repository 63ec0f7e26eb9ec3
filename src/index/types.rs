//! Core data types and error definitions for the index cache.

use crate::embedding::EmbeddingClientError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::splitter::SplitError;

/// Errors produced while building, loading or persisting an index artifact.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Index names must be usable as a single directory component.
    #[error("invalid index name {0:?}")]
    InvalidName(String),
    /// Building or refreshing the named index failed.
    #[error("failed to build index '{name}': {reason}")]
    Build {
        /// Index being built.
        name: String,
        /// What went wrong.
        reason: String,
    },
    /// A persisted artifact exists but cannot be used.
    #[error("failed to load index '{name}': {reason}")]
    Load {
        /// Index being loaded.
        name: String,
        /// What went wrong.
        reason: String,
    },
    /// Filesystem failure.
    #[error("index storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted JSON could not be encoded or decoded.
    #[error("index storage encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    /// Embedding backend failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Node splitting failed.
    #[error(transparent)]
    Split(#[from] SplitError),
}

/// Name of one logical index under the persistence root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexName(String);

impl IndexName {
    /// Default name of the vector index.
    pub const VECTOR: &'static str = "vector_index";
    /// Default name of the summary index.
    pub const SUMMARY: &'static str = "summary_index";

    /// Validate `name` as a single, non-hidden path component.
    pub fn new(name: impl Into<String>) -> Result<Self, IndexError> {
        let name = name.into();
        let valid = !name.trim().is_empty()
            && name != ".."
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        if valid {
            Ok(Self(name))
        } else {
            Err(IndexError::InvalidName(name))
        }
    }

    /// The default vector index name.
    pub fn vector() -> Self {
        Self(Self::VECTOR.to_string())
    }

    /// The default summary index name.
    pub fn summary() -> Self {
        Self(Self::SUMMARY.to_string())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IndexName {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IndexName {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IndexName> for String {
    fn from(name: IndexName) -> Self {
        name.0
    }
}

/// What an artifact stores per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Nodes carry embeddings for similarity search.
    Vector,
    /// Nodes carry text only and are read in full for summaries.
    Summary,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vector => "vector",
            Self::Summary => "summary",
        })
    }
}

/// Already-extracted source document with a stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identity used to detect already-indexed documents.
    pub id: String,
    /// Extracted text content.
    pub text: String,
    /// Arbitrary metadata such as the source file name.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Create a document without metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// SHA-256 over text and metadata; changes whenever either changes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        for (key, value) in &self.metadata {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// One chunk of a document as stored in an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    /// Identity of the source document.
    pub doc_id: String,
    /// Chunk text.
    pub text: String,
    /// Present on vector artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Metadata inherited from the document.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Which nodes a document produced and the content they were produced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    /// [`Document::content_hash`] at indexing time.
    pub content_hash: String,
    /// Nodes derived from the document, in order.
    pub node_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_must_be_plain_components() {
        assert!(IndexName::new("vector").is_ok());
        assert!(IndexName::new("summary-2024").is_ok());
        for bad in ["", "  ", "..", ".hidden", "a/b", "a\\b"] {
            assert!(IndexName::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn content_hash_tracks_text_and_metadata() {
        let doc = Document::new("a.txt", "hello");
        assert_eq!(doc.content_hash(), Document::new("other", "hello").content_hash());
        assert_ne!(doc.content_hash(), Document::new("a.txt", "hello!").content_hash());
        assert_ne!(
            doc.content_hash(),
            doc.clone().with_metadata("file_name", "a.txt").content_hash()
        );
    }

    #[test]
    fn index_name_round_trips_through_serde() {
        let name: IndexName = serde_json::from_str("\"vector_index\"").expect("name");
        assert_eq!(name, IndexName::vector());
        assert!(serde_json::from_str::<IndexName>("\"../escape\"").is_err());
    }
}
