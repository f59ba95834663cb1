//! Error handling for Conductor Core.
//!
//! This module provides:
//! - A single crate error type with machine-readable codes
//! - User-facing messages kept apart from internal diagnostics
//! - Severity-aware logging through `tracing`
//! - Error counters through `metrics`
//!
//! # Usage
//!
//! ```rust,ignore
//! use conductor_core::error::{ConductorError, ErrorContext, Result};
//!
//! fn read_plan(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path).context("Failed to read plan file")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::dag::{TaskId, TaskState};
use crate::executor::{ExecutionError, ExecutionErrorKind};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Graph Errors (1000-1099)
    CyclicDependency,
    TaskNotFound,
    TaskAlreadyExists,
    InvalidStateTransition,
    DependencyNotMet,

    // Execution Errors (1200-1299)
    ExecutionFailed,
    TaskTimeout,
    TaskCancelled,
    ExecutorUnavailable,

    // Persistence Errors (2000-2099)
    PersistenceError,
    StoreConnectionFailed,
    CorruptRecord,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    QueueClosed,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::CyclicDependency => 1000,
            Self::TaskNotFound => 1002,
            Self::TaskAlreadyExists => 1003,
            Self::InvalidStateTransition => 1004,
            Self::DependencyNotMet => 1005,

            Self::ExecutionFailed => 1200,
            Self::TaskTimeout => 1201,
            Self::TaskCancelled => 1202,
            Self::ExecutorUnavailable => 1203,

            Self::PersistenceError => 2000,
            Self::StoreConnectionFailed => 2001,
            Self::CorruptRecord => 2002,

            Self::SerializationError => 2200,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::QueueClosed => 9001,
            Self::InternalError => 9000,
        }
    }

    /// Check if this error type is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed
                | Self::TaskTimeout
                | Self::PersistenceError
                | Self::StoreConnectionFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::CyclicDependency
            | Self::TaskNotFound
            | Self::TaskAlreadyExists
            | Self::InvalidStateTransition
            | Self::DependencyNotMet => "graph",

            Self::ExecutionFailed
            | Self::TaskTimeout
            | Self::TaskCancelled
            | Self::ExecutorUnavailable => "execution",

            Self::PersistenceError | Self::StoreConnectionFailed | Self::CorruptRecord => {
                "persistence"
            }

            Self::SerializationError => "serialization",

            Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration => "configuration",

            Self::QueueClosed | Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad ids, rejected submissions)
    Low,
    /// Operational issues (executor failures, timeouts)
    Medium,
    /// System errors (storage failures)
    High,
    /// Broken internal invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::CyclicDependency
            | ErrorCode::TaskNotFound
            | ErrorCode::TaskAlreadyExists
            | ErrorCode::DependencyNotMet
            | ErrorCode::TaskCancelled
            | ErrorCode::QueueClosed => Self::Low,

            ErrorCode::ExecutionFailed
            | ErrorCode::TaskTimeout
            | ErrorCode::ExecutorUnavailable
            | ErrorCode::InvalidStateTransition => Self::Medium,

            ErrorCode::PersistenceError
            | ErrorCode::CorruptRecord
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conductor Core.
#[derive(Error, Debug)]
pub struct ConductorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Caller-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConductorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::metrics::ERRORS,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConductorError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ConductorError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConductorError::new(ErrorCode::TaskNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConductorError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for ConductorError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to task store")
        } else if error.is_timeout() {
            (ErrorCode::PersistenceError, "Task store operation timed out")
        } else {
            (ErrorCode::PersistenceError, "A task store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::CorruptRecord
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ConductorError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TaskTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for ConductorError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let user_msg = match error.kind() {
            ErrorKind::NotFound => "File or resource not found",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::TimedOut => "I/O operation timed out",
            _ => "An I/O error occurred",
        };

        Self::with_internal(ErrorCode::PersistenceError, user_msg, error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for ConductorError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

impl From<ExecutionError> for ConductorError {
    fn from(error: ExecutionError) -> Self {
        let code = match error.kind {
            ExecutionErrorKind::Failed => ErrorCode::ExecutionFailed,
            ExecutionErrorKind::Timeout => ErrorCode::TaskTimeout,
            ExecutionErrorKind::Cancelled => ErrorCode::TaskCancelled,
        };
        let message = error.message.clone();
        Self::new(code, message).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConductorError {
    /// Create a cyclic dependency error.
    pub fn cyclic_dependency(task_id: TaskId) -> Self {
        Self::new(
            ErrorCode::CyclicDependency,
            format!("Adding task {} would create a dependency cycle", task_id),
        )
        .with_details(ErrorDetails::new().with_entity("task", task_id.to_string()))
    }

    /// Create a task not found error.
    pub fn task_not_found(task_id: TaskId) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task_id))
            .with_details(ErrorDetails::new().with_entity("task", task_id.to_string()))
    }

    /// Create a task already exists error.
    pub fn task_already_exists(task_id: TaskId) -> Self {
        Self::new(ErrorCode::TaskAlreadyExists, format!("Task already exists: {}", task_id))
            .with_details(ErrorDetails::new().with_entity("task", task_id.to_string()))
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: TaskState, to: TaskState) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid task state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
    }

    /// Create an error for a dependency that settled without completing.
    pub fn dependency_not_met(task_id: TaskId, dependency: TaskId, state: TaskState) -> Self {
        Self::new(
            ErrorCode::DependencyNotMet,
            format!("Dependency {} of task {} settled as {}", dependency, task_id, state),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("task", task_id.to_string())
                .with_context("dependency", dependency.to_string())
                .with_context("dependency_state", state),
        )
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::PersistenceError, "Task store operation failed", message)
    }

    /// Create a corrupt record error.
    pub fn corrupt_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::CorruptRecord,
            format!("Stored task record is malformed: {}", key),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("record", key))
    }

    /// Create an error for submissions after shutdown began.
    pub fn queue_closed() -> Self {
        Self::new(ErrorCode::QueueClosed, "Task queue is not accepting submissions")
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::CyclicDependency.numeric_code(), 1000);
        assert_eq!(ErrorCode::CorruptRecord.numeric_code(), 2002);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 9000);
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::ExecutionFailed.is_retryable());
        assert!(ErrorCode::TaskTimeout.is_retryable());
        assert!(!ErrorCode::CyclicDependency.is_retryable());
        assert!(!ErrorCode::InvalidStateTransition.is_retryable());
    }

    #[test]
    fn test_task_not_found() {
        let id = TaskId::new();
        let error = ConductorError::task_not_found(id);

        assert_eq!(error.code(), ErrorCode::TaskNotFound);
        assert_eq!(error.details().entity_id, Some(id.to_string()));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_invalid_transition_context() {
        let error = ConductorError::invalid_state_transition(TaskState::Completed, TaskState::Running);

        assert_eq!(error.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(error.details().context["from_state"], "completed");
        assert_eq!(error.details().context["to_state"], "running");
    }

    #[test]
    fn test_from_serde_error_is_corrupt_record() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error = ConductorError::from(parse);
        assert_eq!(error.code(), ErrorCode::CorruptRecord);
    }

    #[test]
    fn test_from_execution_error() {
        let timeout = ExecutionError::timeout(std::time::Duration::from_secs(3));
        assert_eq!(ConductorError::from(timeout).code(), ErrorCode::TaskTimeout);

        let failed = ExecutionError::fatal("boom");
        assert_eq!(ConductorError::from(failed).code(), ErrorCode::ExecutionFailed);
    }

    #[test]
    fn test_error_display() {
        let error = ConductorError::with_internal(
            ErrorCode::PersistenceError,
            "Task store operation failed",
            "disk full",
        );

        let display = format!("{}", error);
        assert!(display.contains("PersistenceError"));
        assert!(display.contains("Task store operation failed"));
        assert!(display.contains("disk full"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("no such task").unwrap_err();
        assert_eq!(error.code(), ErrorCode::TaskNotFound);
    }
}
