//! Persistent named index cache.
//!
//! Artifacts are built from documents, persisted atomically under a root directory and refreshed
//! in place when the same documents are offered again.

pub mod artifact;
pub mod cache;
pub mod splitter;
pub mod storage;
pub mod types;

pub use artifact::{ArtifactBuilder, FORMAT_VERSION, IndexArtifact, Manifest, RefreshSummary};
pub use cache::{BuildConcurrency, IndexCache};
pub use splitter::{NodeSplitter, SplitError};
pub use types::{DocRef, Document, IndexError, IndexKind, IndexName, Node};
