//! Retrieval and summary query plans and their execution.

pub mod engine;
pub mod plan;
mod prompts;

pub use engine::{QueryAnswer, QueryEngine, QueryError};
pub use plan::{
    PlanError, QueryPlan, QueryPlanBuilder, ResponseMode, RetrievalPlan, ScoredNode,
    SimilarityPostFilter, SummaryPlan,
};
