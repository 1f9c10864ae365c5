//! Caller-facing error taxonomy.

use axum::http::StatusCode;
use thiserror::Error;

use crate::engine::EngineError;

/// Whether a failed transition was caused by the request or by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    Caller,
    Engine,
}

impl From<&EngineError> for FaultOrigin {
    fn from(err: &EngineError) -> Self {
        if err.is_caller_fault() {
            FaultOrigin::Caller
        } else {
            FaultOrigin::Engine
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Namespace missing or not carrying the marker label.
    #[error("namespace not valid")]
    Validation { namespace: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("service {0} not found")]
    NotFound(String),

    #[error("No endpoints available for: {0}.")]
    NoEndpoints(String),

    /// Dial failure, timeout or non-2xx answer from a supervisor.
    #[error("Can't reach service for: {function}.")]
    Upstream {
        function: String,
        target: String,
        reason: String,
    },

    #[error("malformed response from {target}: {source}")]
    BadUpstreamPayload {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{action} {function} failed: {source}")]
    Transition {
        action: &'static str,
        function: String,
        origin: FaultOrigin,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The caller went away before an irreversible step.
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProviderError::Validation { .. } | ProviderError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
            ProviderError::NoEndpoints(_) | ProviderError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProviderError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProviderError::BadUpstreamPayload { .. } => StatusCode::BAD_GATEWAY,
            ProviderError::Transition { origin, .. } => match origin {
                FaultOrigin::Caller => StatusCode::BAD_REQUEST,
                FaultOrigin::Engine => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ProviderError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
