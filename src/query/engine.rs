//! Plan execution and response synthesis.

use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::plan::{QueryPlan, ResponseMode, RetrievalPlan, SummaryPlan};
use super::prompts::{answer_prompt, combine_prompt, refine_prompt};
use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::generation::{GenerationClient, GenerationClientError, GenerationRequest};

/// Failures inside a single query execution.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Embedding the query failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// A synthesis call failed.
    #[error(transparent)]
    Generation(#[from] GenerationClientError),
    /// The embedding backend answered without a vector.
    #[error("embedding backend returned no vector for the query")]
    MissingQueryEmbedding,
}

/// Outcome of [`QueryEngine::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAnswer {
    /// Synthesised response.
    Answer(String),
    /// The query was blank; no backend was contacted.
    EmptyQuery,
    /// No plan was available to execute.
    Unavailable,
    /// Retrieval found nothing above the similarity cutoff.
    NoRelevantContext,
    /// Execution failed; holds the cause.
    Failed(String),
}

impl QueryAnswer {
    /// Short machine-readable status.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Answer(_) => "answered",
            Self::EmptyQuery => "empty_query",
            Self::Unavailable => "unavailable",
            Self::NoRelevantContext => "no_relevant_context",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether the backend produced a response.
    pub fn is_answer(&self) -> bool {
        matches!(self, Self::Answer(_))
    }
}

impl fmt::Display for QueryAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Answer(text) => f.write_str(text),
            Self::EmptyQuery => f.write_str("Please enter a question."),
            Self::Unavailable => f.write_str("Query engine not available."),
            Self::NoRelevantContext => {
                f.write_str("No relevant context was found in the indexed documents.")
            }
            Self::Failed(cause) => write!(f, "Error during query: {cause}"),
        }
    }
}

/// Executes plans against the embedding and generation backends.
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingClient>,
    generator: Arc<dyn GenerationClient>,
    model: RwLock<String>,
    max_context_chars: usize,
}

impl QueryEngine {
    /// Create an engine generating with `model`; prompts carry at most `max_context_chars` of context.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
        model: impl Into<String>,
        max_context_chars: usize,
    ) -> Self {
        Self {
            embedder,
            generator,
            model: RwLock::new(model.into()),
            max_context_chars: max_context_chars.max(1),
        }
    }

    /// Model used for synthesis.
    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Switch the synthesis model for subsequent queries.
    pub fn set_model(&self, model: impl Into<String>) {
        *self
            .model
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = model.into();
    }

    /// Run `query` through `plan`. Never fails; problems are folded into the answer.
    pub async fn execute(&self, plan: Option<&QueryPlan>, query: &str) -> QueryAnswer {
        if query.trim().is_empty() {
            return QueryAnswer::EmptyQuery;
        }
        let Some(plan) = plan else {
            tracing::warn!("Query received without an executable plan");
            return QueryAnswer::Unavailable;
        };

        let outcome = match plan {
            QueryPlan::Retrieval(plan) => self.run_retrieval(plan, query).await,
            QueryPlan::Summary(plan) => self.run_summary(plan, query).await,
        };
        match outcome {
            Ok(answer) => answer,
            Err(error) => {
                tracing::error!(error = %error, "Query failed");
                QueryAnswer::Failed(error.to_string())
            }
        }
    }

    async fn run_retrieval(
        &self,
        plan: &RetrievalPlan,
        query: &str,
    ) -> Result<QueryAnswer, QueryError> {
        let embedding = self
            .embedder
            .generate_embeddings(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(QueryError::MissingQueryEmbedding)?;

        let hits = plan.retrieve(&embedding);
        tracing::debug!(
            index = %plan.artifact().name(),
            candidates = plan.candidate_count(),
            kept = hits.len(),
            "Retrieved context"
        );
        if hits.is_empty() {
            return Ok(QueryAnswer::NoRelevantContext);
        }

        let texts: Vec<&str> = hits.iter().map(|hit| hit.node.text.as_str()).collect();
        let answer = self.compact(query, &texts).await?;
        Ok(QueryAnswer::Answer(answer))
    }

    async fn run_summary(&self, plan: &SummaryPlan, query: &str) -> Result<QueryAnswer, QueryError> {
        let texts: Vec<&str> = plan
            .artifact()
            .nodes()
            .iter()
            .map(|node| node.text.as_str())
            .collect();
        tracing::debug!(
            index = %plan.artifact().name(),
            mode = %plan.mode(),
            nodes = texts.len(),
            "Synthesising summary"
        );

        let answer = match plan.mode() {
            ResponseMode::Compact => self.compact(query, &texts).await?,
            ResponseMode::Refine => self.refine(query, &texts).await?,
            ResponseMode::TreeSummarize => self.tree_summarize(query, &texts).await?,
            ResponseMode::SimpleSummarize => self.simple_summarize(query, &texts).await?,
        };
        Ok(QueryAnswer::Answer(answer))
    }

    async fn compact(&self, query: &str, texts: &[&str]) -> Result<String, QueryError> {
        let windows = pack(texts, self.max_context_chars);
        self.refine_over(query, &windows).await
    }

    async fn refine(&self, query: &str, texts: &[&str]) -> Result<String, QueryError> {
        let windows: Vec<String> = texts
            .iter()
            .map(|text| truncate_chars(text, self.max_context_chars).to_string())
            .collect();
        self.refine_over(query, &windows).await
    }

    async fn refine_over(&self, query: &str, windows: &[String]) -> Result<String, QueryError> {
        let Some((first, rest)) = windows.split_first() else {
            return Ok(String::new());
        };
        let mut answer = self.generate(answer_prompt(query, first)).await?;
        for window in rest {
            answer = self
                .generate(refine_prompt(query, &answer, window))
                .await?;
        }
        Ok(answer)
    }

    async fn tree_summarize(&self, query: &str, texts: &[&str]) -> Result<String, QueryError> {
        let mut partials = Vec::new();
        for window in pack(texts, self.max_context_chars) {
            partials.push(self.generate(answer_prompt(query, &window)).await?);
        }

        while partials.len() > 1 {
            let refs: Vec<&str> = partials.iter().map(String::as_str).collect();
            let mut groups = pack_groups(&refs, self.max_context_chars);
            if groups.len() >= partials.len() {
                // Partials too long to share a window; merge pairwise so every round shrinks.
                let half = (self.max_context_chars / 2).max(1);
                groups = partials
                    .chunks(2)
                    .map(|pair| {
                        pair.iter()
                            .map(|partial| truncate_chars(partial, half).to_string())
                            .collect()
                    })
                    .collect();
            }
            let mut next = Vec::with_capacity(groups.len());
            for group in groups {
                if group.len() == 1 {
                    next.extend(group);
                    continue;
                }
                next.push(self.generate(combine_prompt(query, &group)).await?);
            }
            partials = next;
        }
        Ok(partials.pop().unwrap_or_default())
    }

    async fn simple_summarize(&self, query: &str, texts: &[&str]) -> Result<String, QueryError> {
        let joined = texts.join("\n\n");
        let context = truncate_chars(&joined, self.max_context_chars);
        self.generate(answer_prompt(query, context)).await
    }

    async fn generate(&self, prompt: String) -> Result<String, QueryError> {
        let request = GenerationRequest {
            model: self.model(),
            prompt,
        };
        Ok(self.generator.generate(request).await?)
    }
}

/// Greedily pack texts into windows of at most `budget` characters; oversized texts are cut.
fn pack(texts: &[&str], budget: usize) -> Vec<String> {
    pack_groups(texts, budget)
        .into_iter()
        .map(|group| group.join("\n\n"))
        .collect()
}

fn pack_groups(texts: &[&str], budget: usize) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut used = 0;
    for text in texts {
        let text = truncate_chars(text.trim(), budget);
        if text.is_empty() {
            continue;
        }
        let len = text.chars().count();
        let separator = if current.is_empty() { 0 } else { 2 };
        if !current.is_empty() && used + separator + len > budget {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += if current.is_empty() { len } else { len + 2 };
        current.push(text.to_string());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
