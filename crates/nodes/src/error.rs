//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the attempt may be repeated when the node has a retry policy.
/// - every other variant fails the attempt immediately and hands it to the
///   node's error strategy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure (rate limit, timeout, flaky upstream).
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// Inputs were present but unusable (wrong type, division by zero, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing variable: {0}")]
    MissingVariable(String),

    /// A collaborator this node needs was not configured for the run.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Stable error type name surfaced as `error_type` on fail-branch outputs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "RetryableError",
            Self::Fatal(_) => "FatalError",
            Self::InvalidInput(_) => "InvalidInputError",
            Self::MissingVariable(_) => "MissingVariableError",
            Self::Unsupported(_) => "UnsupportedError",
        }
    }
}
