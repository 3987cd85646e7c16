//! Error taxonomy shared across the engine
//!
//! Two kinds of errors live here:
//! - [`ExecutionError`] is the structured record persisted in an execution's
//!   `error` column and returned from introspection.
//! - [`TaskError`] is what task handlers raise; the worker wraps it into an
//!   `ExecutionError` and decides retryability from its kind.

use serde::{Deserialize, Serialize};

/// Classification of execution failures
///
/// The kind decides retryability: permanent kinds fail the execution on the
/// first occurrence, everything else goes through the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Function name not present in the registry
    UnknownFunction,

    /// Inputs could not be deserialized or validated
    InputValidation,

    /// Execution exceeded its timeout
    Timeout,

    /// Execution was cancelled
    Cancelled,

    /// Workflow replay diverged from recorded history
    NonDeterminism,

    /// Catch-all for retryable failures
    Transient,
}

impl ErrorKind {
    /// Permanent kinds are never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnknownFunction | Self::InputValidation | Self::Cancelled | Self::NonDeterminism
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownFunction => "unknown_function",
            Self::InputValidation => "input_validation",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NonDeterminism => "non_determinism",
            Self::Transient => "transient",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured failure record persisted on a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Human-readable message
    pub message: String,

    /// Failure classification
    pub kind: ErrorKind,

    /// Optional error chain / backtrace text
    pub trace: Option<String>,
}

impl ExecutionError {
    /// Create a new error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            trace: None,
        }
    }

    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Attach error chain text
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Whether the retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        !self.kind.is_permanent()
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Error raised by task handlers
///
/// Handlers that want a permanent failure construct one explicitly;
/// anything bubbled up through `anyhow` is treated as transient.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub kind: ErrorKind,
}

impl TaskError {
    /// Retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Transient,
        }
    }

    /// Permanent failure: the inputs are malformed
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::InputValidation,
        }
    }

    /// Permanent failure: the execution was cancelled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Cancelled,
        }
    }

    /// Failure with an explicit kind
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<TaskError> for ExecutionError {
    fn from(err: TaskError) -> Self {
        ExecutionError::new(err.kind, err.message)
    }
}
