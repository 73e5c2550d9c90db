//! Orchestrator Module
//!
//! Sessions, the execution graph that routes between capabilities, the
//! engine that drives a session through it, and the dispatch facade.

pub mod checkpoint;
pub mod dispatch;
pub mod engine;
#[macro_use]
pub mod event_bus;
pub mod graph;
pub mod session;

pub use checkpoint::{Checkpointer, JsonFileCheckpointer, MemoryCheckpointer};
pub use dispatch::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::{EngineConfig, ExecutionEngine, RunReport, StepOutput};
pub use event_bus::{DispatchEvent, EventBus, EVENT_BUS};
pub use graph::{Edge, Graph, GraphDefinition, Guard, NoMatchPolicy, Node, NodeKind};
pub use session::{
    Role, Session, SessionStatus, SessionStore, StateMutation, SuspendedSessionPolicy, Turn,
};
