// ABOUTME: Error taxonomy for the orchestration core.
// ABOUTME: One variant per failure kind; operational calls surface these to callers.

use std::time::Duration;
use thiserror::Error;

use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation} not allowed while session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("{} timed out after {}s", .operation, .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("spawn failed: {0}")]
    SpawnFailure(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("task store unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("assignment conflict: task {0} is already assigned")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }

    /// Stable kind label used in CLI output and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Timeout { .. } => "timeout",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::ParseFailure(_) => "parse_failure",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Conflict(_) => "conflict",
            Self::Io(_) => "io",
            Self::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
