//! Retrieval and summary plans bound to an index snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::embedding::cosine_similarity;
use crate::index::{IndexArtifact, IndexKind, Node};

/// Reasons a plan could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Retrieval needs embeddings, which only vector indexes carry.
    #[error("index '{name}' is a {kind} index, not a vector index")]
    NotVectorIndex {
        /// Index offered.
        name: String,
        /// Its kind.
        kind: IndexKind,
    },
    /// At least one candidate must be requested.
    #[error("top_k must be at least 1")]
    ZeroTopK,
    /// More candidates than the engine is willing to score and synthesise.
    #[error("{requested} candidates requested, at most {max} allowed")]
    TooManyCandidates {
        /// Effective candidate count.
        requested: usize,
        /// Configured ceiling.
        max: usize,
    },
    /// A non-empty vector index whose nodes carry no embeddings.
    #[error("index '{0}' has no embeddings")]
    MissingEmbeddings(String),
}

/// How retrieved or stored text is turned into one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Pack texts into as few prompts as fit, then refine across them.
    Compact,
    /// Answer from the first text and refine with each following one.
    Refine,
    /// Answer each packed prompt, then combine answers pairwise upward.
    #[default]
    TreeSummarize,
    /// Concatenate and truncate into a single prompt.
    SimpleSummarize,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compact => "compact",
            Self::Refine => "refine",
            Self::TreeSummarize => "tree_summarize",
            Self::SimpleSummarize => "simple_summarize",
        })
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compact" => Ok(Self::Compact),
            "refine" => Ok(Self::Refine),
            "tree_summarize" => Ok(Self::TreeSummarize),
            "simple_summarize" => Ok(Self::SimpleSummarize),
            other => Err(format!("unknown response mode '{other}'")),
        }
    }
}

/// Node paired with its similarity to the query.
#[derive(Debug, Clone, Copy)]
pub struct ScoredNode<'a> {
    /// Retrieved node.
    pub node: &'a Node,
    /// Cosine similarity to the query embedding.
    pub score: f32,
}

/// Drops candidates scoring below a fixed cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityPostFilter {
    cutoff: f32,
}

impl SimilarityPostFilter {
    /// Filter keeping scores greater than or equal to `cutoff`.
    pub fn new(cutoff: f32) -> Self {
        Self { cutoff }
    }

    /// Configured cutoff.
    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    /// Keep the candidates at or above the cutoff, preserving order.
    pub fn apply<'a>(&self, candidates: Vec<ScoredNode<'a>>) -> Vec<ScoredNode<'a>> {
        candidates
            .into_iter()
            .filter(|candidate| candidate.score >= self.cutoff)
            .collect()
    }
}

/// Similarity search over a vector index snapshot.
#[derive(Debug, Clone)]
pub struct RetrievalPlan {
    artifact: Arc<IndexArtifact>,
    base_top_k: usize,
    candidate_count: usize,
    widened: bool,
    post_filter: SimilarityPostFilter,
}

impl RetrievalPlan {
    /// Index snapshot the plan searches.
    pub fn artifact(&self) -> &Arc<IndexArtifact> {
        &self.artifact
    }

    /// `top_k` requested by the caller.
    pub fn base_top_k(&self) -> usize {
        self.base_top_k
    }

    /// Candidates retrieved before post-filtering.
    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }

    /// Whether the candidate pool was widened.
    pub fn is_widened(&self) -> bool {
        self.widened
    }

    /// Post-filter applied to candidates.
    pub fn post_filter(&self) -> SimilarityPostFilter {
        self.post_filter
    }

    /// Best candidates for `query_embedding`, highest score first, after post-filtering.
    pub fn retrieve(&self, query_embedding: &[f32]) -> Vec<ScoredNode<'_>> {
        let mut scored: Vec<ScoredNode<'_>> = self
            .artifact
            .nodes()
            .iter()
            .filter_map(|node| {
                node.embedding.as_ref().map(|embedding| ScoredNode {
                    node,
                    score: cosine_similarity(query_embedding, embedding),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.candidate_count);
        self.post_filter.apply(scored)
    }
}

/// Full-content synthesis over a summary index snapshot.
#[derive(Debug, Clone)]
pub struct SummaryPlan {
    artifact: Arc<IndexArtifact>,
    mode: ResponseMode,
}

impl SummaryPlan {
    /// Index snapshot the plan reads.
    pub fn artifact(&self) -> &Arc<IndexArtifact> {
        &self.artifact
    }

    /// Synthesis mode.
    pub fn mode(&self) -> ResponseMode {
        self.mode
    }
}

/// Executable plan handed to the query engine.
#[derive(Debug, Clone)]
pub enum QueryPlan {
    /// Similarity retrieval then compact synthesis.
    Retrieval(RetrievalPlan),
    /// Synthesis over every node.
    Summary(SummaryPlan),
}

impl From<RetrievalPlan> for QueryPlan {
    fn from(plan: RetrievalPlan) -> Self {
        Self::Retrieval(plan)
    }
}

impl From<SummaryPlan> for QueryPlan {
    fn from(plan: SummaryPlan) -> Self {
        Self::Summary(plan)
    }
}

/// Builds plans with the configured cutoff and candidate ceiling.
#[derive(Debug, Clone, Copy)]
pub struct QueryPlanBuilder {
    similarity_cutoff: f32,
    max_candidates: usize,
}

impl Default for QueryPlanBuilder {
    fn default() -> Self {
        Self::new(0.7, 100)
    }
}

impl QueryPlanBuilder {
    /// Create a builder.
    pub fn new(similarity_cutoff: f32, max_candidates: usize) -> Self {
        Self {
            similarity_cutoff,
            max_candidates,
        }
    }

    /// Retrieval plan over `artifact`, or `None` when there is nothing to plan against.
    ///
    /// With `widen` the candidate pool doubles; if that plan cannot be built, one retry is made
    /// with the plain `top_k` before giving up.
    pub fn build_retrieval_plan(
        &self,
        artifact: Option<&Arc<IndexArtifact>>,
        top_k: usize,
        widen: bool,
    ) -> Option<RetrievalPlan> {
        let artifact = artifact?;
        let candidates = if widen { top_k.saturating_mul(2) } else { top_k };

        match self.try_retrieval_plan(artifact, top_k, candidates) {
            Ok(plan) => Some(plan),
            Err(error) if widen => {
                tracing::warn!(
                    index = %artifact.name(),
                    error = %error,
                    top_k,
                    "Widened retrieval unavailable; falling back to plain top_k"
                );
                match self.try_retrieval_plan(artifact, top_k, top_k) {
                    Ok(plan) => Some(plan),
                    Err(error) => {
                        tracing::error!(index = %artifact.name(), error = %error, "Retrieval plan failed");
                        None
                    }
                }
            }
            Err(error) => {
                tracing::error!(index = %artifact.name(), error = %error, "Retrieval plan failed");
                None
            }
        }
    }

    fn try_retrieval_plan(
        &self,
        artifact: &Arc<IndexArtifact>,
        top_k: usize,
        candidate_count: usize,
    ) -> Result<RetrievalPlan, PlanError> {
        if artifact.kind() != IndexKind::Vector {
            return Err(PlanError::NotVectorIndex {
                name: artifact.name().to_string(),
                kind: artifact.kind(),
            });
        }
        if top_k == 0 {
            return Err(PlanError::ZeroTopK);
        }
        if candidate_count > self.max_candidates {
            return Err(PlanError::TooManyCandidates {
                requested: candidate_count,
                max: self.max_candidates,
            });
        }
        if !artifact.is_empty() && artifact.embedding_dimension().is_none() {
            return Err(PlanError::MissingEmbeddings(artifact.name().to_string()));
        }
        Ok(RetrievalPlan {
            artifact: Arc::clone(artifact),
            base_top_k: top_k,
            candidate_count,
            widened: candidate_count != top_k,
            post_filter: SimilarityPostFilter::new(self.similarity_cutoff),
        })
    }

    /// Summary plan over `artifact`; `None` when it is absent or holds no nodes.
    pub fn build_summary_plan(
        &self,
        artifact: Option<&Arc<IndexArtifact>>,
        mode: ResponseMode,
    ) -> Option<SummaryPlan> {
        let Some(artifact) = artifact else {
            tracing::debug!("No summary index available");
            return None;
        };
        if artifact.is_empty() {
            tracing::warn!(index = %artifact.name(), "Summary index holds no content");
            return None;
        }
        Some(SummaryPlan {
            artifact: Arc::clone(artifact),
            mode,
        })
    }
}
