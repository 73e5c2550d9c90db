//! Echo Orchestrator
//!
//! A multi-agent orchestration core:
//! - Capability registry with discovery and an activation lifecycle
//! - Single-flight model factory over pluggable provider connectors
//! - Session store with optimistic concurrency and checkpoints
//! - Execution graph engine with guarded routing
//! - Dispatch facade and a thin HTTP surface

pub mod agent;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plugins;
pub mod server;
pub mod telemetry;

// Re-exports for convenience
pub use agent::{ModelFactory, ModelParameters};
pub use config::Settings;
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use orchestrator::{DispatchOutcome, Dispatcher, Graph, Session, SessionStore};
pub use plugins::{Capability, CapabilityOutput, CapabilityRegistry};
