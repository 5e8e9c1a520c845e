use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following TABLET-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Resource errors (pools, connections, timeouts)
/// - **2000-2999**: Query errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Authorization and policy errors
/// - **5000-5999**: Internal/serving-state errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Resource Errors (1000-1999) ===
    /// TABLET-1001: Timed out waiting for a pooled connection
    PoolTimeout = 1001,
    /// TABLET-1002: Pool is closed
    PoolClosed = 1002,
    /// TABLET-1003: Transaction pool is at capacity
    TxPoolFull = 1003,
    /// TABLET-1004: Connection to the database was lost
    ConnectionLost = 1004,
    /// TABLET-1005: Statement exceeded the query timeout or caller deadline
    QueryTimeout = 1005,

    // === Query Errors (2000-2999) ===
    /// TABLET-2001: SQL could not be parsed
    SyntaxError = 2001,
    /// TABLET-2002: DML cannot be rewritten safely in strict mode
    DmlTooComplex = 2002,
    /// TABLET-2003: Result exceeds max_result_size
    RowCountExceeded = 2003,
    /// TABLET-2004: Statement requires a transaction
    DisallowedOutsideTransaction = 2004,
    /// TABLET-2005: Transaction id unknown
    NotInTransaction = 2005,
    /// TABLET-2006: Transaction id is used by another statement
    TransactionInUse = 2006,
    /// TABLET-2007: Begin inside an open transaction
    NestedTransaction = 2007,
    /// TABLET-2008: Batch with no queries
    EmptyBatch = 2008,
    /// TABLET-2009: Caller cancelled the request
    QueryCancelled = 2009,
    /// TABLET-2010: Database rejected the statement
    SqlError = 2010,
    /// TABLET-2011: Bind variable referenced but not supplied
    MissingBindVariable = 2011,
    /// TABLET-2012: Statement shape not supported
    UnsupportedQuery = 2012,
    /// TABLET-2013: Lock wait timeout or deadlock in the database
    LockConflict = 2013,

    // === Configuration Errors (3000-3999) ===
    /// TABLET-3001: Invalid configuration value
    InvalidConfig = 3001,
    /// TABLET-3002: Query rule could not be built
    InvalidQueryRule = 3002,
    /// TABLET-3003: Rule source is not registered
    UnknownRuleSource = 3003,
    /// TABLET-3004: Rule source already registered
    DuplicateRuleSource = 3004,
    /// TABLET-3005: Table ACL configuration invalid
    InvalidAclConfig = 3005,

    // === Authorization Errors (4000-4999) ===
    /// TABLET-4001: Table ACL denied the caller
    TableAclDenied = 4001,
    /// TABLET-4002: No caller identity on the request
    MissingCallerId = 4002,
    /// TABLET-4003: Query rule with FAIL action matched
    RuleFail = 4003,
    /// TABLET-4004: Query rule with FAIL_RETRY action matched
    RuleFailRetry = 4004,

    // === Internal Errors (5000-5999) ===
    /// TABLET-5001: Server is not serving queries
    NotServing = 5001,
    /// TABLET-5002: Transactions are only allowed on a master tablet
    NonMasterTransaction = 5002,
    /// TABLET-5003: Serialization/deserialization failed
    SerializationFailed = 5003,
    /// TABLET-5004: Unexpected internal state
    Internal = 5004,
    /// TABLET-5005: Schema could not be loaded
    SchemaLoadFailed = 5005,

    /// TABLET-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "TABLET-2002")
    pub fn as_str(&self) -> String {
        format!("TABLET-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Resource,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Auth,
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may retry. Transient resource exhaustion, lost
    /// connections, lock conflicts, FAIL_RETRY rules and non-serving state
    /// are retryable; everything else is a permanent failure.
    pub fn classification(&self) -> Classification {
        match self {
            Self::PoolTimeout
            | Self::PoolClosed
            | Self::TxPoolFull
            | Self::ConnectionLost
            | Self::QueryTimeout
            | Self::LockConflict
            | Self::RuleFailRetry
            | Self::NotServing => Classification::Retry,
            _ => Classification::Fail,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("TABLET-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::PoolTimeout),
            1002 => Ok(Self::PoolClosed),
            1003 => Ok(Self::TxPoolFull),
            1004 => Ok(Self::ConnectionLost),
            1005 => Ok(Self::QueryTimeout),
            2001 => Ok(Self::SyntaxError),
            2002 => Ok(Self::DmlTooComplex),
            2003 => Ok(Self::RowCountExceeded),
            2004 => Ok(Self::DisallowedOutsideTransaction),
            2005 => Ok(Self::NotInTransaction),
            2006 => Ok(Self::TransactionInUse),
            2007 => Ok(Self::NestedTransaction),
            2008 => Ok(Self::EmptyBatch),
            2009 => Ok(Self::QueryCancelled),
            2010 => Ok(Self::SqlError),
            2011 => Ok(Self::MissingBindVariable),
            2012 => Ok(Self::UnsupportedQuery),
            2013 => Ok(Self::LockConflict),
            3001 => Ok(Self::InvalidConfig),
            3002 => Ok(Self::InvalidQueryRule),
            3003 => Ok(Self::UnknownRuleSource),
            3004 => Ok(Self::DuplicateRuleSource),
            3005 => Ok(Self::InvalidAclConfig),
            4001 => Ok(Self::TableAclDenied),
            4002 => Ok(Self::MissingCallerId),
            4003 => Ok(Self::RuleFail),
            4004 => Ok(Self::RuleFailRetry),
            5001 => Ok(Self::NotServing),
            5002 => Ok(Self::NonMasterTransaction),
            5003 => Ok(Self::SerializationFailed),
            5004 => Ok(Self::Internal),
            5005 => Ok(Self::SchemaLoadFailed),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Resource,
    Query,
    Config,
    Auth,
    Internal,
}

/// Caller-facing retry contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Permanent; retrying the same request will fail the same way.
    Fail,
    /// Transient; the caller should retry with backoff.
    Retry,
}
