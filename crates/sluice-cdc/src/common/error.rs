//! Error types for CDC operations
//!
//! One crate-wide error enum with classification helpers for retry decisions
//! and metric-safe error codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Change-log access errors (reads, bound queries, catalog lookups)
    ChangeLog,
    /// Schema-related errors (missing metadata, schema application)
    Schema,
    /// Event dispatch errors (emission, failure-mode escalation)
    Dispatch,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Serialization errors (JSON)
    Serialization,
    /// Task lifecycle errors (interruption, invalid state)
    Lifecycle,
    /// Other/unknown errors
    Other,
}

/// CDC-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// I/O failure while reading the change log; safe to retry
    #[error("Change log read failed: {0}")]
    ReadFailure(String),

    /// The change table was dropped while it was being read
    #[error("Change table for capture instance '{capture_instance}' no longer exists")]
    ChangeTableGone { capture_instance: String },

    /// The log window has no data for the requested bound
    #[error("Log position not available: {0}")]
    NotAvailable(String),

    /// No schema registered for a watched collection
    #[error("No metadata registered for captured table {collection}")]
    MissingSchema { collection: String },

    /// Fatal processing error raised under the FAIL failure mode
    #[error("Error while processing event at offset {offset}: {source}")]
    EventProcessing {
        offset: String,
        #[source]
        source: Box<CdcError>,
    },

    /// The outbound queue was closed or the task was cancelled
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Schema application error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Signal decoding or execution error
    #[error("Signal error: {0}")]
    Signal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a new read failure
    pub fn read_failure(msg: impl Into<String>) -> Self {
        Self::ReadFailure(msg.into())
    }

    /// Create a change-table-gone error
    pub fn change_table_gone(capture_instance: impl Into<String>) -> Self {
        Self::ChangeTableGone {
            capture_instance: capture_instance.into(),
        }
    }

    /// Create a not-available error
    pub fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable(msg.into())
    }

    /// Create a missing schema error
    pub fn missing_schema(collection: impl std::fmt::Display) -> Self {
        Self::MissingSchema {
            collection: collection.to_string(),
        }
    }

    /// Wrap an error with the offset at which it happened
    pub fn event_processing(offset: impl Into<String>, source: CdcError) -> Self {
        Self::EventProcessing {
            offset: offset.into(),
            source: Box::new(source),
        }
    }

    /// Create an interrupted error
    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::Interrupted(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new signal error
    pub fn signal(msg: impl Into<String>) -> Self {
        Self::Signal(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Only change-log read failures are transient. A dropped change table
    /// needs rediscovery rather than a blind retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ReadFailure(_) => true,
            Self::EventProcessing { source, .. } => source.is_retriable(),

            Self::ChangeTableGone { .. }
            | Self::NotAvailable(_)
            | Self::MissingSchema { .. }
            | Self::Interrupted(_)
            | Self::Schema(_)
            | Self::Signal(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Whether the error means the task is shutting down.
    ///
    /// Interruptions bypass the failure handling mode: the record was never
    /// fully enqueued, so its offset must not be treated as processed.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ReadFailure(_) => ErrorCategory::ChangeLog,
            Self::ChangeTableGone { .. } => ErrorCategory::ChangeLog,
            Self::NotAvailable(_) => ErrorCategory::ChangeLog,
            Self::MissingSchema { .. } => ErrorCategory::Schema,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::EventProcessing { .. } => ErrorCategory::Dispatch,
            Self::Signal(_) => ErrorCategory::Dispatch,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Interrupted(_) => ErrorCategory::Lifecycle,
            Self::InvalidState(_) => ErrorCategory::Lifecycle,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ReadFailure(_) => "read_failure",
            Self::ChangeTableGone { .. } => "change_table_gone",
            Self::NotAvailable(_) => "not_available",
            Self::MissingSchema { .. } => "missing_schema",
            Self::EventProcessing { .. } => "event_processing",
            Self::Interrupted(_) => "interrupted",
            Self::Schema(_) => "schema_error",
            Self::Signal(_) => "signal_error",
            Self::Config(_) => "config_error",
            Self::Json(_) => "json_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
