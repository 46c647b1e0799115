//! Error handling for Drover.
//!
//! This module provides:
//! - A single error type with a machine-readable code and severity
//! - User-facing messages separate from internal detail
//! - Structured details (entity, context, suggested action)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Configuration and not-found errors are returned to callers of the
//! engine. Everything that goes wrong while a job executes is recovered
//! inside the processing engine and only ever shows up in logs and in the
//! monitoring store.
//!
//! # Usage
//!
//! ```rust,ignore
//! use drover_core::error::{DroverError, ErrorContext, ErrorCode, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("jobs.toml").with_error_code(ErrorCode::MissingConfiguration)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Drover operations.
pub type Result<T> = std::result::Result<T, DroverError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Setup Errors (1000-1099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
    InvalidSchedule,
    DuplicateJob,

    // Dispatch Errors (1100-1199)
    JobNotFound,

    // Execution Errors (1200-1299)
    HandlerFailed,
    HandlerTimedOut,
    HandlerPanicked,

    // Backing Store Errors (2000-2099)
    QueueError,
    QueueConnectionFailed,
    MonitoringError,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ConfigurationError => 1000,
            Self::MissingConfiguration => 1001,
            Self::InvalidConfiguration => 1002,
            Self::InvalidSchedule => 1003,
            Self::DuplicateJob => 1004,

            Self::JobNotFound => 1100,

            Self::HandlerFailed => 1200,
            Self::HandlerTimedOut => 1201,
            Self::HandlerPanicked => 1202,

            Self::QueueError => 2000,
            Self::QueueConnectionFailed => 2001,
            Self::MonitoringError => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueError
                | Self::QueueConnectionFailed
                | Self::MonitoringError
                | Self::HandlerFailed
                | Self::HandlerTimedOut
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "configuration",
            1100..=1199 => "dispatch",
            1200..=1299 => "execution",
            2000..=2099 => "backing_store",
            2200..=2299 => "serialization",
            9000..=9099 => "internal",
            _ => "unknown",
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
    /// Caller errors (unknown job name)
    Low,
    /// Job execution problems (handler failures, timeouts)
    Medium,
    /// Setup and data problems
    High,
    /// Backing store unreachable or internal bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound => Self::Low,

            ErrorCode::HandlerFailed | ErrorCode::HandlerTimedOut | ErrorCode::HandlerPanicked => {
                Self::Medium
            }

            ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InvalidSchedule
            | ErrorCode::DuplicateJob
            | ErrorCode::QueueError
            | ErrorCode::MonitoringError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::High,

            ErrorCode::QueueConnectionFailed | ErrorCode::InternalError => Self::Critical,
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

    /// Related entity ID (job name, job id, ...)
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

/// The main error type for Drover.
#[derive(Error, Debug)]
pub struct DroverError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for DroverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DroverError {
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

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True for every error raised while validating engine setup.
    pub fn is_configuration(&self) -> bool {
        self.code.category() == "configuration"
    }

    /// True when a job name was not registered.
    pub fn is_job_not_found(&self) -> bool {
        self.code == ErrorCode::JobNotFound
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
            "drover_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
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
        self.map_err(|e| DroverError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| DroverError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| DroverError::new(ErrorCode::InternalError, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| DroverError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for DroverError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::QueueConnectionFailed, "Unable to connect to the backing store")
        } else if error.is_timeout() {
            (ErrorCode::QueueError, "Backing store operation timed out")
        } else {
            (ErrorCode::QueueError, "A backing store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for DroverError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::task::JoinError> for DroverError {
    fn from(error: tokio::task::JoinError) -> Self {
        let code = if error.is_panic() {
            ErrorCode::HandlerPanicked
        } else {
            ErrorCode::InternalError
        };
        Self::with_internal(code, "A background task did not finish", error.to_string())
    }
}

impl From<std::io::Error> for DroverError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::MissingConfiguration, "File not found"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::QueueConnectionFailed, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for DroverError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<DroverError>() {
            Ok(drover_error) => drover_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for DroverError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file could not be parsed")
            }
            config::ConfigError::Type { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration value has the wrong type")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<cron::error::Error> for DroverError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidSchedule,
            "Schedule is not a valid cron expression",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain-Specific Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl DroverError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// A configuration value that is required was not supplied.
    pub fn missing_configuration(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingConfiguration,
            format!("The engine setup is missing `{}`", field),
        )
        .with_details(ErrorDetails::new().with_entity("setting", field))
    }

    /// A job definition failed validation.
    pub fn invalid_job(name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::InvalidConfiguration,
            format!("Job definition `{}` is invalid: {}", name, reason),
        )
        .with_details(ErrorDetails::new().with_entity("job", name))
    }

    /// Two definitions share a name.
    pub fn duplicate_job(name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateJob,
            format!("The job `{}` is registered more than once", name),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", name)
                .with_suggestion("Give every job definition a unique name"),
        )
    }

    /// A schedule string is neither a cron expression nor a known alias.
    pub fn invalid_schedule(name: &str, schedule: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidSchedule,
            format!("Job `{}` has an invalid schedule \"{}\"", name, schedule),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("job", name))
    }

    /// Job configuration not found.
    pub fn job_not_found(name: &str) -> Self {
        Self::new(ErrorCode::JobNotFound, "Job configuration not found")
            .with_details(ErrorDetails::new().with_entity("job", name))
    }

    /// Create a backing queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::QueueError, "A backing store error occurred", message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::DuplicateJob.category(), "configuration");
        assert_eq!(ErrorCode::InvalidSchedule.category(), "configuration");
        assert_eq!(ErrorCode::JobNotFound.category(), "dispatch");
        assert_eq!(ErrorCode::HandlerTimedOut.category(), "execution");
        assert_eq!(ErrorCode::QueueConnectionFailed.category(), "backing_store");
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::QueueConnectionFailed.is_retryable());
        assert!(ErrorCode::HandlerTimedOut.is_retryable());
        assert!(!ErrorCode::JobNotFound.is_retryable());
        assert!(!ErrorCode::ConfigurationError.is_retryable());
    }

    #[test]
    fn test_job_not_found() {
        let error = DroverError::job_not_found("send-email");
        assert!(error.is_job_not_found());
        assert!(!error.is_configuration());
        assert_eq!(error.user_message(), "Job configuration not found");
        assert_eq!(error.details().entity_id.as_deref(), Some("send-email"));
    }

    #[test]
    fn test_setup_errors_are_configuration() {
        assert!(DroverError::missing_configuration("logger").is_configuration());
        assert!(DroverError::duplicate_job("a").is_configuration());
        assert!(DroverError::invalid_job("a", "no handler").is_configuration());
        assert!(DroverError::invalid_schedule("a", "sometimes", "unknown alias").is_configuration());
    }

    #[test]
    fn test_error_context() {
        let error = DroverError::new(ErrorCode::InvalidConfiguration, "bad job")
            .with_context("field", "attempts")
            .with_context("value", 0);

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("value"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::JobNotFound), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::HandlerFailed), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::DuplicateJob), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::QueueConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::MissingConfiguration).unwrap_err();
        assert_eq!(error.code(), ErrorCode::MissingConfiguration);
    }

    #[test]
    fn test_from_serde_json_error() {
        let error: DroverError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(error.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_error_display() {
        let error = DroverError::with_internal(
            ErrorCode::QueueError,
            "A backing store error occurred",
            "Connection refused: localhost:6379",
        );

        let display = format!("{}", error);
        assert!(display.contains("QueueError"));
        assert!(display.contains("A backing store error occurred"));
        assert!(display.contains("Connection refused"));
    }
}
