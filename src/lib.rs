#![deny(missing_docs)]

//! Core library for rustydoc: local document Q&A on top of an Ollama daemon.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Session context shared by the HTTP and CLI front ends.
pub mod context;
/// Inference daemon supervision and model catalog.
pub mod daemon;
/// Filesystem document loading.
pub mod documents;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Text generation client.
pub mod generation;
/// Persistent named index cache.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Index cache metrics helpers.
pub mod metrics;
/// Query plans and execution.
pub mod query;
