use crate::{ErrorCode, ErrorContext, TabletError};

impl From<std::io::Error> for TabletError {
    fn from(err: std::io::Error) -> Self {
        TabletError::new(ErrorCode::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for TabletError {
    fn from(err: serde_json::Error) -> Self {
        TabletError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<serde_yaml::Error> for TabletError {
    fn from(err: serde_yaml::Error) -> Self {
        let field = err.location().map(|l| format!("line {}", l.line()));
        TabletError::new(ErrorCode::InvalidConfig, err.to_string()).with_context(
            ErrorContext::Config {
                file_path: None,
                field,
            },
        )
    }
}

/// Database error numbers (MySQL) that influence classification.
pub mod mysql {
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
}

impl TabletError {
    /// Wrap a database error, classifying it by error number.
    pub fn from_sql(number: u16, state: &str, message: impl Into<String>) -> Self {
        let code = match number {
            mysql::CR_SERVER_GONE_ERROR | mysql::CR_SERVER_LOST => ErrorCode::ConnectionLost,
            mysql::ER_LOCK_WAIT_TIMEOUT | mysql::ER_LOCK_DEADLOCK => ErrorCode::LockConflict,
            mysql::ER_QUERY_INTERRUPTED => ErrorCode::QueryTimeout,
            _ => ErrorCode::SqlError,
        };
        TabletError::new(code, message).with_sql_error(number, state)
    }
}
