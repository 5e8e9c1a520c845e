//! Database driver seam.
//!
//! The engine never talks to a concrete client library. A deployment plugs in a
//! [`ConnectionFactory`] that hands out [`DbConnection`]s; tests use
//! [`crate::testing::FakeDb`].

use async_trait::async_trait;
use tablet_common::QueryResult;
use tablet_error::TabletError;

/// An error reported by the database server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (errno {number}) (sqlstate {state})")]
pub struct SqlError {
    pub number: u16,
    pub state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(number: u16, state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            number,
            state: state.into(),
            message: message.into(),
        }
    }
}

impl From<SqlError> for TabletError {
    fn from(err: SqlError) -> Self {
        TabletError::from_sql(err.number, &err.state, err.to_string())
    }
}

/// One open session with the database.
#[async_trait]
pub trait DbConnection: Send {
    /// Run a single statement and return its complete result.
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, SqlError>;

    /// False once the session is known to be unusable.
    fn is_open(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, SqlError>;
}
