//! Engine error types.

use thiserror::Error;

use super::TaskState;

/// Errors reported by a container engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Namespace, container or task does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The task is not in a state that allows the operation.
    #[error("task {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: TaskState,
        actual: TaskState,
    },

    /// Network attach/detach failure.
    #[error("network: {0}")]
    Network(String),

    /// Engine unreachable or failed internally.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn container_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    }

    /// Whether the error stems from what the caller asked for rather than
    /// from an engine fault.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound { .. } | EngineError::InvalidState { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
