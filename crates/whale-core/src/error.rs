use std::time::Duration;

use thiserror::Error;

use crate::run::{Phase, ResourceKind};

#[derive(Debug, Error)]
pub enum WhaleError {
    /// Rejected before any cluster call was made
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} '{name}' already exists")]
    ResourceConflict { kind: ResourceKind, name: String },

    /// Transient cluster communication failure, safe to retry
    #[error("cluster API unavailable: {0}")]
    ApiUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("deployment '{name}' not ready after {waited:?}")]
    Timeout { name: String, waited: Duration },

    #[error("deployment '{name}' failed: {reason}")]
    DeploymentFailed { name: String, reason: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("cleanup incomplete, {} resource(s) left behind: {}", .0.len(), .0.join("; "))]
    CleanupIncomplete(Vec<String>),

    #[error("invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("config error: {0}")]
    Config(String),

    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Any other non-transient API failure
    #[error("cluster API error: {0}")]
    Api(String),
}

pub type Result<T, E = WhaleError> = std::result::Result<T, E>;

impl WhaleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    /// Only transient errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ApiUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
