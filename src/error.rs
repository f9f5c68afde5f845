//! Engine error taxonomy.
//!
//! Every error that crosses the engine boundary carries a stable code, a
//! category, a severity, a retryable flag, and ordered recovery suggestions
//! so callers can react without string-matching messages.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification used by the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Wrong call order, technique/plan mismatch.
    Workflow,
    /// Malformed or missing parameter.
    Validation,
    /// Session/plan/group not found, expired, or in an invalid state.
    State,
    /// I/O, memory, persistence. Usually retryable.
    System,
    /// Synthesis failed, dependency not met, parallel execution failed.
    Convergence,
}

impl ErrorCategory {
    /// Whether errors in this category default to being retryable.
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::System)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Validation => write!(f, "validation"),
            Self::State => write!(f, "state"),
            Self::System => write!(f, "system"),
            Self::Convergence => write!(f, "convergence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Structured engine error.
///
/// Constructed through the category helpers (`EngineError::validation`,
/// `EngineError::state`, ...) plus the `with_*` builders for recovery
/// guidance and context.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct EngineError {
    /// Stable machine-readable code, e.g. `SESSION_NOT_FOUND`.
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    /// Ordered, caller-facing recovery suggestions.
    pub recovery_steps: Vec<String>,
    /// Optional structured context (sorted for stable output).
    pub context: BTreeMap<String, serde_json::Value>,
    /// Hint for how long to wait before retrying, when retryable.
    pub retry_after: Option<Duration>,
}

impl EngineError {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category,
            severity: ErrorSeverity::Error,
            retryable: category.default_retryable(),
            recovery_steps: Vec::new(),
            context: BTreeMap::new(),
            retry_after: None,
        }
    }

    pub fn workflow(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Workflow, code, message)
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn state(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::State, code, message)
    }

    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, code, message)
    }

    pub fn convergence(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Convergence, code, message)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_recovery(mut self, steps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.recovery_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    // === Common constructors ===

    pub fn invalid_session_id(id: &str) -> Self {
        Self::validation(
            "INVALID_SESSION_ID",
            format!("Session id '{}' does not match [A-Za-z0-9._-]{{1,64}}", id),
        )
        .with_recovery(["Use only alphanumerics, '.', '_', '-' and at most 64 characters"])
    }

    pub fn session_exists(id: &str) -> Self {
        Self::state("SESSION_EXISTS", format!("Session already exists: {}", id))
            .with_recovery(["Reuse the existing session or choose a different id"])
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::state("SESSION_NOT_FOUND", format!("Session not found: {}", id))
            .with_recovery(["Create the session first", "Check whether it expired"])
    }

    pub fn plan_not_found(id: &str) -> Self {
        Self::state("PLAN_NOT_FOUND", format!("Plan not found: {}", id))
    }

    pub fn group_not_found(id: &str) -> Self {
        Self::state("GROUP_NOT_FOUND", format!("Parallel group not found: {}", id))
    }

    pub fn sessions_exhausted(max: usize) -> Self {
        Self::system(
            "SESSIONS_EXHAUSTED",
            format!("Session capacity reached ({} live sessions)", max),
        )
        .with_severity(ErrorSeverity::Critical)
        .with_retryable(false)
        .with_recovery([
            "Delete finished sessions",
            "Lower the session TTL",
            "Raise max_sessions in the store configuration",
        ])
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::validation(
            "MISSING_PARAMETER",
            format!("Required parameter missing: {}", name),
        )
        .with_recovery([format!("Provide '{}' and retry the call", name)])
    }

    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::state(
            "INVALID_TRANSITION",
            format!("Invalid status transition: {} -> {}", from, to),
        )
    }

    pub fn locks_cleared(id: &str) -> Self {
        Self::state(
            "LOCKS_CLEARED",
            format!("Lock registry cleared while waiting for '{}'", id),
        )
    }

    pub fn circular_dependency(cycle: &[String]) -> Self {
        Self::validation(
            "CIRCULAR_DEPENDENCY",
            format!("Dependency cycle detected: {}", cycle.join(" -> ")),
        )
        .with_recovery(["Remove one dependency edge from the cycle"])
    }

    /// Wrap any unclassified failure so internal types never leak.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::system("INTERNAL", message).with_severity(ErrorSeverity::Critical)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::system("IO", err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation("JSON", err.to_string()).with_retryable(false)
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::validation("TOML", err.to_string()).with_retryable(false)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_errors_default_retryable() {
        assert!(EngineError::system("IO", "disk full").retryable);
        assert!(!EngineError::validation("BAD", "nope").retryable);
        assert!(!EngineError::workflow("ORDER", "nope").retryable);
    }

    #[test]
    fn test_builder_chain() {
        let err = EngineError::state("SESSION_NOT_FOUND", "gone")
            .with_severity(ErrorSeverity::Warning)
            .with_context("session_id", "abc")
            .with_retry_after(Duration::from_secs(2));

        assert_eq!(err.severity, ErrorSeverity::Warning);
        assert_eq!(err.context["session_id"], "abc");
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_display_includes_code() {
        let err = EngineError::missing_parameter("techniques");
        assert!(err.to_string().contains("MISSING_PARAMETER"));
        assert!(err.to_string().contains("techniques"));
    }
}
