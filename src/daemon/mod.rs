//! Supervision of the local inference daemon (Ollama).

pub mod catalog;
pub mod probe;
pub mod signals;
pub mod supervisor;

pub use catalog::{ModelCatalog, SUGGESTED_MODELS, suggested_models};
pub use probe::{HttpHealthProbe, LivenessProbe};
pub use supervisor::{DaemonError, DaemonHandle, ServiceStatus, ServiceSupervisor, SupervisorSettings};
