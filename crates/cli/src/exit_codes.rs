//! Structured exit codes for machine-readable error handling.
//!
//! These codes let deploy pipelines tell a broken file from a rejected statement.

/// Success (standard convention)
#[allow(dead_code)]
pub const SUCCESS: i32 = 0;

/// General error (fallback for unknown errors)
pub const GENERAL_ERROR: i32 = 1;

/// Configuration error (unreadable or invalid config, rules or ACL file)
pub const CONFIG_ERROR: i32 = 3;

/// Validation error (statement rejected by the planner)
pub const VALIDATION_ERROR: i32 = 5;
