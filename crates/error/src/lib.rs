//! # tablet-error
//!
//! Unified error types for the tablet query engine.
//!
//! Every error leaving the engine carries:
//! - A stable numeric code (TABLET-XXXX)
//! - A classification telling the caller whether a retry may succeed
//! - Optional structured context and the underlying database error number

mod code;
mod context;
mod convert;

pub use code::{Classification, ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::mysql;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database error number and SQLSTATE preserved across wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlErrorInfo {
    pub number: u16,
    pub state: String,
}

/// The unified error type for all tablet operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletError {
    /// Numeric error code (e.g., "TABLET-2001")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Set when the error originated in the database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_error: Option<SqlErrorInfo>,
}

impl TabletError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
            sql_error: None,
        }
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach the originating database error number and state
    pub fn with_sql_error(mut self, number: u16, state: impl Into<String>) -> Self {
        self.sql_error = Some(SqlErrorInfo {
            number,
            state: state.into(),
        });
        self
    }

    pub fn classification(&self) -> Classification {
        self.code.classification()
    }

    /// True when the caller may retry the same request, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        self.classification() == Classification::Retry
    }

    /// Database error number, if any.
    pub fn sql_errno(&self) -> Option<u16> {
        self.sql_error.as_ref().map(|e| e.number)
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize TabletError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for TabletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for TabletError {}

/// Result type alias for tablet operations
pub type Result<T> = std::result::Result<T, TabletError>;
