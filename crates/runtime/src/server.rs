//! The tablet server: serving state, request admission and the public
//! `QueryService` / `Controller` surface.
//!
//! # Request path
//!
//! 1. Admission: the server must be serving (or shutting down, for requests
//!    inside an open transaction). Admitted requests are counted so that
//!    `stop_service` can wait for them.
//! 2. Planning through the plan cache.
//! 3. Policy: query rules, then the table ACL.
//! 4. Execution by a [`QueryExecutor`].
//! 5. Query log, stats, and in terse mode the error message rewrite.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tablet_common::config::TabletConfig;
use tablet_common::redact::{query_as_string, terse_sql_error};
use tablet_common::{BindVariables, BoundQuery, QueryContext, QueryResult};
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tokio::sync::Notify;
use tracing::{info, warn};
use validator::Validate;

use crate::acl::TableAcl;
use crate::controller::{BatchError, Controller, QueryService, ServingState, TabletType};
use crate::db::ConnectionFactory;
use crate::dialect::{ConflictKeyParser, MySqlConflictParser};
use crate::engine::{EngineOptions, QueryEngine};
use crate::executor::QueryExecutor;
use crate::policy::Policy;
use crate::rowcache::CacheService;
use crate::rules::{QueryRules, FILE_CUSTOM_RULE};
use crate::schema::SchemaSource;
use crate::stats::TabletStats;

pub struct TabletServerBuilder {
    config: TabletConfig,
    factory: Arc<dyn ConnectionFactory>,
    schema_source: Option<Arc<dyn SchemaSource>>,
    cache_service: Option<Arc<dyn CacheService>>,
    conflict_parser: Arc<dyn ConflictKeyParser>,
}

impl TabletServerBuilder {
    /// Read table definitions from `source` instead of the database.
    pub fn schema_source(mut self, source: Arc<dyn SchemaSource>) -> Self {
        self.schema_source = Some(source);
        self
    }

    pub fn cache_service(mut self, service: Arc<dyn CacheService>) -> Self {
        self.cache_service = Some(service);
        self
    }

    pub fn conflict_parser(mut self, parser: Arc<dyn ConflictKeyParser>) -> Self {
        self.conflict_parser = parser;
        self
    }

    pub fn build(self) -> Result<TabletServer> {
        self.config.validate().map_err(|e| {
            TabletError::new(
                ErrorCode::InvalidConfig,
                format!("invalid tablet configuration: {}", e),
            )
        })?;
        let stats = TabletStats::new().map_err(|e| {
            TabletError::new(ErrorCode::Internal, format!("cannot register metrics: {}", e))
        })?;
        Ok(TabletServer {
            inner: Arc::new(Inner {
                policy: Arc::new(Policy::new(&self.config)),
                config: self.config,
                factory: self.factory,
                schema_source: self.schema_source,
                cache_service: self.cache_service,
                conflict_parser: self.conflict_parser,
                stats: Arc::new(stats),
                status: Mutex::new(Status {
                    state: ServingState::NotServing,
                    tablet_type: TabletType::Replica,
                }),
                engine: RwLock::new(None),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ServingState,
    tablet_type: TabletType,
}

struct Inner {
    config: TabletConfig,
    factory: Arc<dyn ConnectionFactory>,
    schema_source: Option<Arc<dyn SchemaSource>>,
    cache_service: Option<Arc<dyn CacheService>>,
    conflict_parser: Arc<dyn ConflictKeyParser>,
    policy: Arc<Policy>,
    stats: Arc<TabletStats>,
    status: Mutex<Status>,
    engine: RwLock<Option<Arc<QueryEngine>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

/// An admitted request. Dropping it lets a pending shutdown proceed.
struct RequestGuard {
    inner: Arc<Inner>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Serves queries for one tablet. Cheap to clone.
#[derive(Clone)]
pub struct TabletServer {
    inner: Arc<Inner>,
}

impl fmt::Debug for TabletServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.lock();
        f.debug_struct("TabletServer")
            .field("state", &status.state)
            .field("tablet_type", &status.tablet_type)
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TabletServer {
    pub fn builder(config: TabletConfig, factory: Arc<dyn ConnectionFactory>) -> TabletServerBuilder {
        TabletServerBuilder {
            config,
            factory,
            schema_source: None,
            cache_service: None,
            conflict_parser: Arc::new(MySqlConflictParser),
        }
    }

    pub fn new(config: TabletConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        Self::builder(config, factory).build()
    }

    pub fn config(&self) -> &TabletConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &Arc<TabletStats> {
        &self.inner.stats
    }

    pub fn tablet_type(&self) -> TabletType {
        self.inner.status.lock().tablet_type
    }

    /// The engine of the current serving period, if any.
    pub fn engine(&self) -> Option<Arc<QueryEngine>> {
        self.inner.engine.read().clone()
    }

    /// Replace the table ACL; `None` disables table checks.
    pub fn set_table_acl(&self, acl: Option<TableAcl>) {
        self.inner.policy.set_table_acl(acl);
    }

    fn not_serving(state: ServingState) -> TabletError {
        TabletError::new(
            ErrorCode::NotServing,
            format!("Query server is in {} state", state),
        )
    }

    fn admit(&self, in_transaction: bool) -> Result<(Arc<QueryEngine>, RequestGuard)> {
        let status = self.inner.status.lock();
        let allowed = match status.state {
            ServingState::Serving => true,
            ServingState::ShuttingDown => in_transaction,
            ServingState::NotServing => false,
        };
        if !allowed {
            return Err(Self::not_serving(status.state));
        }
        let engine = self
            .engine()
            .ok_or_else(|| Self::not_serving(status.state))?;
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok((
            engine,
            RequestGuard {
                inner: self.inner.clone(),
            },
        ))
    }

    fn require_master(&self) -> Result<()> {
        let tablet_type = self.tablet_type();
        if tablet_type != TabletType::Master {
            return Err(TabletError::new(
                ErrorCode::NonMasterTransaction,
                format!("transactions are not allowed on a {} tablet", tablet_type),
            ));
        }
        Ok(())
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Register the rules file and load the ACL file named in the
    /// configuration.
    fn load_policy_files(&self) -> Result<()> {
        let config = &self.inner.config;
        let policy = &self.inner.policy;
        if let Some(path) = &config.query_rules_file {
            let rules = QueryRules::load_file(path)?;
            if !policy.rules.source_names().iter().any(|n| n == FILE_CUSTOM_RULE) {
                policy.rules.register(FILE_CUSTOM_RULE)?;
            }
            info!(path = %path, rules = rules.len(), "loaded query rules");
            policy.rules.set_rules(FILE_CUSTOM_RULE, rules)?;
        }
        if let Some(path) = &config.table_acl_file {
            let acl = TableAcl::load_file(path)?;
            info!(path = %path, "loaded table acl");
            policy.set_table_acl(Some(acl));
        }
        Ok(())
    }

    async fn execute_admitted(
        &self,
        engine: &QueryEngine,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        transaction_id: Option<i64>,
    ) -> Result<QueryResult> {
        let plan = engine.schema.get_plan(sql)?;
        self.inner.policy.check(ctx, sql, &plan, &self.inner.stats)?;
        if transaction_id.is_none() && plan.plan_type.is_dml() && engine.config.enable_autocommit {
            self.require_master()?;
        }
        let result = QueryExecutor::new(engine, ctx, &plan, bind_variables, transaction_id)
            .execute()
            .await?;
        self.inner
            .stats
            .queries
            .with_label_values(&[plan.plan_type.as_str(), plan.stats_table()])
            .inc();
        Ok(result)
    }

    async fn stream_admitted(
        &self,
        engine: &QueryEngine,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        send_reply: &mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> Result<()> {
        let plan = engine.schema.get_plan(sql)?;
        self.inner.policy.check(ctx, sql, &plan, &self.inner.stats)?;
        QueryExecutor::new(engine, ctx, &plan, bind_variables, None)
            .stream(send_reply)
            .await
    }

    /// Log the statement and account for its error, rewriting database
    /// errors in terse mode.
    fn finish<T>(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        let terse = self.inner.config.terse_errors;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let user = ctx.caller_id.as_ref().map_or("", |c| c.username.as_str());
        let query = query_as_string(sql, bind_variables, terse);
        match result {
            Ok(value) => {
                info!(
                    target: "queries",
                    query = %query,
                    user,
                    remote_addr = ctx.remote_addr(),
                    elapsed_ms,
                    "query"
                );
                Ok(value)
            }
            Err(mut err) => {
                self.inner.stats.record_error(&err);
                if terse && !bind_variables.is_empty() {
                    if let Some(errno) = err.sql_errno() {
                        err.message = terse_sql_error(errno, sql);
                    }
                }
                warn!(
                    target: "queries",
                    query = %query,
                    user,
                    remote_addr = ctx.remote_addr(),
                    elapsed_ms,
                    code = %err.code,
                    error = %err.message,
                    "query failed"
                );
                Err(err)
            }
        }
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.inner.stats.record_error(err);
        }
        result
    }
}

#[async_trait]
impl QueryService for TabletServer {
    async fn begin(&self, _ctx: &QueryContext) -> Result<i64> {
        let (engine, _guard) = self.admit(false)?;
        let result = match self.require_master() {
            Ok(()) => engine.tx_pool.begin().await,
            Err(e) => Err(e),
        };
        self.record(result)
    }

    async fn commit(&self, _ctx: &QueryContext, transaction_id: i64) -> Result<()> {
        let (engine, _guard) = self.admit(true)?;
        let result = engine.commit(transaction_id).await;
        self.record(result)
    }

    async fn rollback(&self, _ctx: &QueryContext, transaction_id: i64) -> Result<()> {
        let (engine, _guard) = self.admit(true)?;
        let result = engine.tx_pool.rollback(transaction_id).await;
        self.record(result)
    }

    async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        transaction_id: Option<i64>,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let result = match self.admit(transaction_id.is_some()) {
            Ok((engine, _guard)) => {
                self.execute_admitted(&engine, ctx, sql, bind_variables, transaction_id)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(ctx, sql, bind_variables, started, result)
    }

    async fn execute_batch(
        &self,
        ctx: &QueryContext,
        queries: &[BoundQuery],
        as_transaction: bool,
        transaction_id: Option<i64>,
    ) -> std::result::Result<Vec<QueryResult>, BatchError> {
        if queries.is_empty() {
            return Err(TabletError::new(ErrorCode::EmptyBatch, "Empty query list").into());
        }
        if let (true, Some(id)) = (as_transaction, transaction_id) {
            return Err(TabletError::new(
                ErrorCode::NestedTransaction,
                "cannot start a new transaction in the scope of an existing one",
            )
            .with_context(ErrorContext::Transaction { transaction_id: id })
            .into());
        }

        let implicit = if as_transaction {
            Some(self.begin(ctx).await?)
        } else {
            None
        };
        let transaction_id = implicit.or(transaction_id);
        let mut completed = Vec::with_capacity(queries.len());
        for query in queries {
            match self
                .execute(ctx, &query.sql, &query.bind_variables, transaction_id)
                .await
            {
                Ok(result) => completed.push(result),
                Err(error) => {
                    if let Some(id) = implicit {
                        if let Err(e) = self.rollback(ctx, id).await {
                            warn!(target: "tx", transaction_id = id, error = %e, "batch rollback failed");
                        }
                    }
                    return Err(BatchError { completed, error });
                }
            }
        }
        if let Some(id) = implicit {
            if let Err(error) = self.commit(ctx, id).await {
                return Err(BatchError { completed, error });
            }
        }
        Ok(completed)
    }

    async fn stream_execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_variables: &BindVariables,
        send_reply: &mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> Result<()> {
        let started = Instant::now();
        let result = match self.admit(false) {
            Ok((engine, _guard)) => {
                self.stream_admitted(&engine, ctx, sql, bind_variables, send_reply)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(ctx, sql, bind_variables, started, result)
    }
}

#[async_trait]
impl Controller for TabletServer {
    async fn start_service(&self, tablet_type: TabletType) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut status = self.inner.status.lock();
            if status.state == ServingState::Serving {
                status.tablet_type = tablet_type;
                return Ok(());
            }
        }

        self.load_policy_files()?;
        let engine = Arc::new(QueryEngine::new(EngineOptions {
            config: self.inner.config.clone(),
            factory: self.inner.factory.clone(),
            schema_source: self.inner.schema_source.clone(),
            cache_service: self.inner.cache_service.clone(),
            conflict_parser: self.inner.conflict_parser.clone(),
            policy: self.inner.policy.clone(),
            stats: self.inner.stats.clone(),
        }));
        if let Err(e) = engine.open().await {
            engine.close().await;
            return Err(e);
        }
        *self.inner.engine.write() = Some(engine);
        *self.inner.status.lock() = Status {
            state: ServingState::Serving,
            tablet_type,
        };
        info!(tablet_type = %tablet_type, "tablet serving");
        Ok(())
    }

    async fn stop_service(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut status = self.inner.status.lock();
            if status.state != ServingState::Serving {
                return;
            }
            status.state = ServingState::ShuttingDown;
        }
        info!("tablet shutting down");
        self.wait_for_drain().await;
        let engine = self.inner.engine.write().take();
        if let Some(engine) = engine {
            engine.close().await;
        }
        self.inner.status.lock().state = ServingState::NotServing;
        info!("tablet stopped serving");
    }

    async fn set_serving_type(&self, tablet_type: TabletType, serving: bool) -> Result<()> {
        if serving {
            return self.start_service(tablet_type).await;
        }
        self.stop_service().await;
        self.inner.status.lock().tablet_type = tablet_type;
        Ok(())
    }

    fn serving_state(&self) -> ServingState {
        self.inner.status.lock().state
    }

    async fn is_healthy(&self) -> Result<()> {
        let engine = self
            .engine()
            .ok_or_else(|| Self::not_serving(self.serving_state()))?;
        engine.health_check().await
    }

    async fn reload_schema(&self) -> Result<()> {
        let engine = self
            .engine()
            .ok_or_else(|| Self::not_serving(self.serving_state()))?;
        let changed = engine.schema.reload().await?;
        if let Some(cache) = &engine.row_cache {
            for table in &changed {
                cache.bump_generation(table);
            }
        }
        Ok(())
    }

    fn clear_query_plan_cache(&self) {
        if let Some(engine) = self.engine() {
            engine.schema.clear_plans();
        }
    }

    fn register_query_rule_source(&self, name: &str) -> Result<()> {
        self.inner.policy.rules.register(name)
    }

    fn unregister_query_rule_source(&self, name: &str) {
        self.inner.policy.rules.unregister(name)
    }

    fn set_query_rules(&self, name: &str, rules: QueryRules) -> Result<()> {
        let count = rules.len();
        self.inner.policy.rules.set_rules(name, rules)?;
        info!(source = name, rules = count, "query rules updated");
        Ok(())
    }
}
