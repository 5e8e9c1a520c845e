//! Common utilities, types, and configuration shared across tablet crates.
//!
//! - **Configuration**: Strongly typed engine configuration (`config`).
//! - **Types**: SQL values, fields and results (`types`).
//! - **Request context**: Caller identity, deadline and cancellation (`caller`).
//! - **Redaction**: Query rendering for logs and terse errors (`redact`).
//! - **Telemetry**: Logging setup (`telemetry`).
pub mod caller;
pub mod config;
pub mod redact;
pub mod telemetry;
pub mod types;

pub use caller::{CallInfo, CallerId, QueryContext};
pub use types::{BindVariables, BoundQuery, Field, FieldType, QueryResult, Row, Value};
