//! Error taxonomy for the orchestration core.
//!
//! Every failure that crosses a component boundary is an [`OrchestratorError`].
//! The HTTP layer maps [`ErrorKind`] to status codes; the engine only retries
//! revision conflicts.

use serde::Serialize;
use thiserror::Error;

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    DuplicateCapability,
    RevisionConflict,
    ConcurrentModification,
    ActivationError,
    ProviderConfigError,
    InvalidGraph,
    RoutingDeadEnd,
    StepBudgetExceeded,
    CapabilityFailed,
    InvalidState,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::DuplicateCapability => "duplicate_capability",
            ErrorKind::RevisionConflict => "revision_conflict",
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::ActivationError => "activation_error",
            ErrorKind::ProviderConfigError => "provider_config_error",
            ErrorKind::InvalidGraph => "invalid_graph",
            ErrorKind::RoutingDeadEnd => "routing_dead_end",
            ErrorKind::StepBudgetExceeded => "step_budget_exceeded",
            ErrorKind::CapabilityFailed => "capability_failed",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors are `Clone` so a single failed model construction can be handed to
/// every requester waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("capability {name}@{version} is already registered")]
    DuplicateCapability { name: String, version: String },

    #[error("revision conflict on session '{session_id}': expected {expected}, found {actual}")]
    RevisionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("session '{session_id}' kept changing underneath the engine; gave up after {attempts} attempts")]
    ConcurrentModification { session_id: String, attempts: usize },

    #[error("failed to activate {name}@{version}: {reason}")]
    Activation {
        name: String,
        version: String,
        reason: String,
    },

    #[error("provider configuration error: {0}")]
    ProviderConfig(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("no route out of node '{node}'")]
    RoutingDeadEnd { node: String },

    #[error("session '{session_id}' exceeded the step budget of {max_steps}")]
    StepBudgetExceeded {
        session_id: String,
        max_steps: usize,
        /// Output of the steps that committed before the budget ran out.
        output: String,
    },

    #[error("capability '{name}' failed: {message}")]
    CapabilityFailed { name: String, message: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn capability(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::CapabilityFailed {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::DuplicateCapability { .. } => ErrorKind::DuplicateCapability,
            Self::RevisionConflict { .. } => ErrorKind::RevisionConflict,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::Activation { .. } => ErrorKind::ActivationError,
            Self::ProviderConfig(_) => ErrorKind::ProviderConfigError,
            Self::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Self::RoutingDeadEnd { .. } => ErrorKind::RoutingDeadEnd,
            Self::StepBudgetExceeded { .. } => ErrorKind::StepBudgetExceeded,
            Self::CapabilityFailed { .. } => ErrorKind::CapabilityFailed,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Conflicts clear up on retry; everything else does not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RevisionConflict | ErrorKind::ConcurrentModification
        )
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {}", err))
    }
}
