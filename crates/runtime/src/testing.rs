//! Test doubles for the engine and its embedders.
//!
//! - [`FakeDb`]: a scripted database. Statements are matched lower-cased and
//!   exactly; unknown statements fail like a real server would.
//! - [`MockController`]: a [`Controller`] that records what it was asked to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tablet_common::{Field, FieldType, QueryResult, Row, Value};
use tablet_error::{ErrorCode, Result, TabletError};

use crate::controller::{Controller, ServingState, TabletType};
use crate::db::{ConnectionFactory, DbConnection, SqlError};
use crate::rules::QueryRules;

#[derive(Default)]
struct FakeDbState {
    queries: HashMap<String, QueryResult>,
    rejected: HashMap<String, SqlError>,
    delays: HashMap<String, Duration>,
    log: Vec<String>,
    connect_error: Option<SqlError>,
}

/// Scripted stand-in for the database server.
#[derive(Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<FakeDbState>>,
    connections: Arc<AtomicUsize>,
}

impl FakeDb {
    /// A database that accepts transaction control and the health check.
    pub fn new() -> Self {
        let db = Self::default();
        db.add_query("begin", QueryResult::default());
        db.add_query("commit", QueryResult::default());
        db.add_query("rollback", QueryResult::default());
        db.add_query(
            "select 1 from dual",
            QueryResult::with_rows(
                vec![Field::new("1", FieldType::Int64)],
                vec![vec![Value::Int64(1)]],
            ),
        );
        db
    }

    pub fn add_query(&self, sql: &str, result: QueryResult) {
        let key = sql.to_lowercase();
        let mut state = self.state.lock();
        state.rejected.remove(&key);
        state.queries.insert(key, result);
    }

    pub fn add_rejected_query(&self, sql: &str, err: SqlError) {
        let key = sql.to_lowercase();
        let mut state = self.state.lock();
        state.queries.remove(&key);
        state.rejected.insert(key, err);
    }

    pub fn delete_query(&self, sql: &str) {
        let key = sql.to_lowercase();
        let mut state = self.state.lock();
        state.queries.remove(&key);
        state.rejected.remove(&key);
    }

    /// Hold `sql` for `delay` before answering.
    pub fn add_delay(&self, sql: &str, delay: Duration) {
        self.state.lock().delays.insert(sql.to_lowercase(), delay);
    }

    pub fn set_connect_error(&self, err: Option<SqlError>) {
        self.state.lock().connect_error = err;
    }

    /// Every statement received, in order, as sent.
    pub fn query_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// How many times `sql` was executed.
    pub fn count(&self, sql: &str) -> usize {
        let key = sql.to_lowercase();
        self.state
            .lock()
            .log
            .iter()
            .filter(|q| q.to_lowercase() == key)
            .count()
    }

    /// Connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn respond(&self, sql: &str) -> (Option<Duration>, std::result::Result<QueryResult, SqlError>) {
        let key = sql.to_lowercase();
        let mut state = self.state.lock();
        state.log.push(sql.to_string());
        let delay = state.delays.get(&key).copied();
        let outcome = if let Some(err) = state.rejected.get(&key) {
            Err(err.clone())
        } else if let Some(result) = state.queries.get(&key) {
            Ok(result.clone())
        } else {
            Err(SqlError::new(
                1105,
                "HY000",
                format!("query: {} is not supported on fakedb", sql),
            ))
        };
        (delay, outcome)
    }
}

#[async_trait]
impl ConnectionFactory for FakeDb {
    async fn connect(&self) -> std::result::Result<Box<dyn DbConnection>, SqlError> {
        if let Some(err) = self.state.lock().connect_error.clone() {
            return Err(err);
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection { db: self.clone() }))
    }
}

struct FakeConnection {
    db: FakeDb,
}

#[async_trait]
impl DbConnection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<QueryResult, SqlError> {
        let (delay, outcome) = self.db.respond(sql);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

/// Convenience for scripting row results.
pub fn rows_result(fields: &[(&str, FieldType)], rows: Vec<Row>) -> QueryResult {
    QueryResult::with_rows(
        fields
            .iter()
            .map(|(name, field_type)| Field::new(*name, *field_type))
            .collect(),
        rows,
    )
}

/// A [`Controller`] that only records calls.
#[derive(Default)]
pub struct MockController {
    calls: Mutex<Vec<String>>,
    state: Mutex<(ServingState, Option<TabletType>)>,
    sources: Mutex<HashMap<String, QueryRules>>,
    pub fail_health_check: bool,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn rules(&self, source: &str) -> Option<QueryRules> {
        self.sources.lock().get(source).cloned()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl Controller for MockController {
    async fn start_service(&self, tablet_type: TabletType) -> Result<()> {
        self.record(format!("start_service({})", tablet_type));
        *self.state.lock() = (ServingState::Serving, Some(tablet_type));
        Ok(())
    }

    async fn stop_service(&self) {
        self.record("stop_service");
        self.state.lock().0 = ServingState::NotServing;
    }

    async fn set_serving_type(&self, tablet_type: TabletType, serving: bool) -> Result<()> {
        self.record(format!("set_serving_type({}, {})", tablet_type, serving));
        let state = if serving {
            ServingState::Serving
        } else {
            ServingState::NotServing
        };
        *self.state.lock() = (state, Some(tablet_type));
        Ok(())
    }

    fn serving_state(&self) -> ServingState {
        self.state.lock().0
    }

    async fn is_healthy(&self) -> Result<()> {
        self.record("is_healthy");
        if self.fail_health_check {
            return Err(TabletError::new(ErrorCode::NotServing, "unhealthy"));
        }
        Ok(())
    }

    async fn reload_schema(&self) -> Result<()> {
        self.record("reload_schema");
        Ok(())
    }

    fn clear_query_plan_cache(&self) {
        self.record("clear_query_plan_cache");
    }

    fn register_query_rule_source(&self, name: &str) -> Result<()> {
        self.record(format!("register_query_rule_source({})", name));
        let mut sources = self.sources.lock();
        if sources.contains_key(name) {
            return Err(TabletError::new(
                ErrorCode::DuplicateRuleSource,
                format!("query rule source {} is already registered", name),
            ));
        }
        sources.insert(name.to_string(), QueryRules::default());
        Ok(())
    }

    fn unregister_query_rule_source(&self, name: &str) {
        self.record(format!("unregister_query_rule_source({})", name));
        self.sources.lock().remove(name);
    }

    fn set_query_rules(&self, name: &str, rules: QueryRules) -> Result<()> {
        self.record(format!("set_query_rules({})", name));
        match self.sources.lock().get_mut(name) {
            Some(slot) => {
                *slot = rules;
                Ok(())
            }
            None => Err(TabletError::new(
                ErrorCode::UnknownRuleSource,
                format!("query rule source {} is not registered", name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_db_matches_lowercase() {
        let db = FakeDb::new();
        db.add_query("SELECT a FROM t", QueryResult::affected(3));
        let mut conn = db.connect().await.unwrap();
        assert_eq!(conn.execute("select a from t").await.unwrap().rows_affected, 3);
        assert!(conn.execute("select b from t").await.is_err());
        assert_eq!(db.query_log(), vec!["select a from t", "select b from t"]);
        assert_eq!(db.count("SELECT A FROM T"), 1);
    }

    #[tokio::test]
    async fn test_rejected_query() {
        let db = FakeDb::new();
        db.add_rejected_query("insert into t values (1)", SqlError::new(1062, "23000", "dup"));
        let mut conn = db.connect().await.unwrap();
        let err = conn.execute("insert into t values (1)").await.unwrap_err();
        assert_eq!(err.number, 1062);
    }

    #[tokio::test]
    async fn test_mock_controller_records_calls() {
        let controller = MockController::new();
        controller.start_service(TabletType::Master).await.unwrap();
        controller.register_query_rule_source("FILE_CUSTOM_RULE").unwrap();
        assert!(controller.register_query_rule_source("FILE_CUSTOM_RULE").is_err());
        controller
            .set_query_rules("FILE_CUSTOM_RULE", QueryRules::default())
            .unwrap();
        assert_eq!(controller.serving_state(), ServingState::Serving);
        assert_eq!(
            controller.calls(),
            vec![
                "start_service(master)",
                "register_query_rule_source(FILE_CUSTOM_RULE)",
                "register_query_rule_source(FILE_CUSTOM_RULE)",
                "set_query_rules(FILE_CUSTOM_RULE)",
            ]
        );
    }
}
