// crates/core/src/error.rs

//! Error taxonomy shared by every orchestrator component.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::StepReport;
use crate::synthesizer::SynthesisAttempt;

/// Every failure the orchestrator can surface to a caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A parameter was missing, unparseable or could not be coerced.
    #[error("{0}")]
    Argument(String),

    /// No capability is registered under the requested key.
    #[error("no capability registered as '{0}'")]
    NotFound(String),

    /// A capability with the same key already exists.
    #[error("capability '{0}' is already registered")]
    DuplicateKey(String),

    /// The capability handler reported a failure.
    #[error("capability '{key}' failed: {message}")]
    Capability { key: String, message: String },

    /// Planner output stayed unparseable after the stricter retry.
    #[error("{stage} output could not be parsed after {} attempts: {}", attempts.len(), attempts.join(" | "))]
    Classification {
        stage: &'static str,
        attempts: Vec<String>,
    },

    /// The synthesis quota for a key was consumed without a valid artifact.
    #[error("synthesis of '{key}' exhausted after {} attempt(s)", attempts.len())]
    SynthesisExhausted {
        key: String,
        attempts: Vec<SynthesisAttempt>,
        /// Steps of the aborted instruction that finished before the failure.
        completed: Vec<StepReport>,
    },

    /// A bounded LLM call exceeded its budget.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// The per-instruction iteration ceiling was reached.
    #[error("workflow stopped after {iterations} iterations with {completed}/{planned} steps done")]
    IncompleteWorkflow {
        iterations: usize,
        completed: usize,
        planned: usize,
    },

    /// Cancellation was requested before the given step started.
    #[error("instruction cancelled before step {step}")]
    Cancelled { step: usize },

    /// A backend failed for a reason other than a timeout.
    #[error("{operation} backend call failed: {message}")]
    Backend { operation: String, message: String },
}

impl OrchestratorError {
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    pub fn backend(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Argument(_) => ErrorKind::ArgumentError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateKey(_) => ErrorKind::DuplicateKey,
            Self::Capability { .. } => ErrorKind::CapabilityError,
            Self::Classification { .. } => ErrorKind::ClassificationError,
            Self::SynthesisExhausted { .. } => ErrorKind::SynthesisExhausted,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::IncompleteWorkflow { .. } => ErrorKind::IncompleteWorkflow,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Backend { .. } => ErrorKind::BackendError,
        }
    }

    /// User-visible form: kind tag plus message.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Steps that finished before the instruction aborted.
    pub fn completed_steps(&self) -> &[StepReport] {
        match self {
            Self::SynthesisExhausted { completed, .. } => completed,
            _ => &[],
        }
    }
}

/// Kind tag attached to every user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ArgumentError,
    NotFound,
    DuplicateKey,
    CapabilityError,
    ClassificationError,
    SynthesisExhausted,
    TimeoutError,
    IncompleteWorkflow,
    Cancelled,
    BackendError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ArgumentError => "ArgumentError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::DuplicateKey => "DuplicateKey",
            ErrorKind::CapabilityError => "CapabilityError",
            ErrorKind::ClassificationError => "ClassificationError",
            ErrorKind::SynthesisExhausted => "SynthesisExhausted",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::IncompleteWorkflow => "IncompleteWorkflow",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::BackendError => "BackendError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_carries_kind_and_message() {
        let err = OrchestratorError::Capability {
            key: "mail:send".into(),
            message: "smtp refused".into(),
        };
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::CapabilityError);
        assert!(report.message.contains("smtp refused"));
        assert_eq!(report.to_string(), format!("[CapabilityError] {}", report.message));
    }

    #[test]
    fn test_only_exhausted_synthesis_carries_steps() {
        let err = OrchestratorError::SynthesisExhausted {
            key: "text:reverse".into(),
            attempts: Vec::new(),
            completed: vec![StepReport {
                number: 1,
                description: "List messages".into(),
                command: "mail:list".into(),
                status: crate::orchestrator::StepStatus::Succeeded,
                outcomes: Vec::new(),
                result: None,
            }],
        };
        assert_eq!(err.completed_steps().len(), 1);
        assert_eq!(err.completed_steps()[0].command, "mail:list");
        assert!(OrchestratorError::argument("x").completed_steps().is_empty());
    }

    #[test]
    fn test_backend_error_wraps_raw_text() {
        let err = OrchestratorError::backend("classifier", "HTTP 500 - upstream");
        let text = err.to_string();
        assert!(text.starts_with("classifier backend call failed"));
        assert!(text.contains("HTTP 500"));
    }
}
