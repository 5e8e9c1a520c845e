//! Service-facing traits.
//!
//! [`QueryService`] is what an RPC layer calls for every client request.
//! [`Controller`] is what the process supervisor uses to start, stop and
//! reconfigure the engine. [`crate::TabletServer`] implements both;
//! [`crate::testing::MockController`] stands in for it in tests.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tablet_common::{BindVariables, BoundQuery, QueryContext, QueryResult};
use tablet_error::{Result, TabletError};

use crate::rules::QueryRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingState {
    #[default]
    NotServing,
    Serving,
    /// Draining: requests already in flight may finish, nothing new starts.
    ShuttingDown,
}

impl fmt::Display for ServingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServingState::NotServing => "NOT_SERVING",
            ServingState::Serving => "SERVING",
            ServingState::ShuttingDown => "SHUTTING_DOWN",
        })
    }
}

/// Role of the tablet in its shard. Only a master accepts transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletType {
    Master,
    Replica,
    Rdonly,
    Spare,
    Backup,
}

impl TabletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletType::Master => "master",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Spare => "spare",
            TabletType::Backup => "backup",
        }
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(TabletType::Master),
            "replica" => Ok(TabletType::Replica),
            "rdonly" => Ok(TabletType::Rdonly),
            "spare" => Ok(TabletType::Spare),
            "backup" => Ok(TabletType::Backup),
            other => Err(format!("unknown tablet type: {}", other)),
        }
    }
}

/// Outcome of a failed batch: results of the statements that completed before
/// the failing one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct BatchError {
    pub completed: Vec<QueryResult>,
    pub error: TabletError,
}

impl From<TabletError> for BatchError {
    fn from(error: TabletError) -> Self {
        Self {
            completed: Vec::new(),
            error,
        }
    }
}

/// Request-path operations.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn begin(&self, ctx: &QueryContext) -> Result<i64>;

    async fn commit(&self, ctx: &QueryContext, transaction_id: i64) -> Result<()>;

    async fn rollback(&self, ctx: &QueryContext, transaction_id: i64) -> Result<()>;

    async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        transaction_id: Option<i64>,
    ) -> Result<QueryResult>;

    /// Run statements in order, stopping at the first failure. With
    /// `as_transaction` the batch runs in its own transaction.
    async fn execute_batch(
        &self,
        ctx: &QueryContext,
        queries: &[BoundQuery],
        as_transaction: bool,
        transaction_id: Option<i64>,
    ) -> std::result::Result<Vec<QueryResult>, BatchError>;

    /// Deliver a select's rows in chunks: first a chunk carrying only the
    /// fields, then row chunks bounded by the stream buffer size.
    async fn stream_execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        send_reply: &mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> Result<()>;
}

/// Lifecycle and administration.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn start_service(&self, tablet_type: TabletType) -> Result<()>;

    async fn stop_service(&self);

    /// Change the tablet type, starting or stopping the service as needed.
    async fn set_serving_type(&self, tablet_type: TabletType, serving: bool) -> Result<()>;

    fn serving_state(&self) -> ServingState;

    fn is_serving(&self) -> bool {
        self.serving_state() == ServingState::Serving
    }

    async fn is_healthy(&self) -> Result<()>;

    async fn reload_schema(&self) -> Result<()>;

    fn clear_query_plan_cache(&self);

    fn register_query_rule_source(&self, name: &str) -> Result<()>;

    fn unregister_query_rule_source(&self, name: &str);

    fn set_query_rules(&self, name: &str, rules: QueryRules) -> Result<()>;
}
