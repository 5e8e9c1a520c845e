//! Statement execution.
//!
//! A [`QueryExecutor`] runs one planned statement. It picks the connection
//! (the caller's transaction, an implicit autocommit transaction, or a pooled
//! connection), rewrites the statement for its plan type and applies the
//! engine's limits.
//!
//! # Plan types
//!
//! 1. **Reads**: pass-through selects run as-is with a row bound. Key lookups
//!    (`PK_IN`) and key subqueries (`SELECT_SUBQUERY`) resolve primary keys and
//!    fetch full rows through the row cache.
//! 2. **Key-scoped DML**: the statement is restricted to explicit primary keys
//!    and annotated with them (see [`crate::annotate`]).
//! 3. **Subquery DML**: keys come from a `for update` select bounded by
//!    `max_dml_rows`; the result is flagged partial when the bound was hit.
//! 4. **Upserts**: insert first; a primary key conflict switches to the
//!    update branch.
//! 5. **DDL**: runs in its own transaction, then refreshes the schema cache.
//!
//! Every statement honors the query timeout, the caller's deadline and
//! cancellation. A statement that is aborted leaves its connection in an
//! unknown state; the connection is closed and, inside a transaction, the
//! transaction is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tablet_common::{BindVariables, QueryContext, QueryResult, Row, Value};
use tablet_error::{mysql, ErrorCode, ErrorContext, Result, TabletError};
use tablet_sql::plan::{resolve_pk_rows, resolve_value_rows, secondary_pk_rows};
use tablet_sql::{ExecPlan, InternalBinds, ParsedQuery, PlanType, Reason, Table, TupleEqualityList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::annotate::stream_comment;
use crate::engine::QueryEngine;
use crate::pool::PooledConn;
use crate::rowcache::{order_by_keys, RowFetcher};
use crate::tx_pool::{DirtyKeys, TxGuard};

enum Abort {
    Cancelled,
    TimedOut(Duration),
    Killed,
}

impl Abort {
    fn into_error(self) -> TabletError {
        match self {
            Abort::Cancelled => TabletError::new(ErrorCode::QueryCancelled, "query cancelled"),
            Abort::TimedOut(after) => TabletError::new(
                ErrorCode::QueryTimeout,
                format!("query timed out after {}ms", after.as_millis()),
            ),
            Abort::Killed => TabletError::new(
                ErrorCode::QueryCancelled,
                "transaction was killed after exceeding its timeout",
            ),
        }
    }
}

fn disallowed_outside_transaction() -> TabletError {
    TabletError::new(
        ErrorCode::DisallowedOutsideTransaction,
        "Disallowed outside transaction",
    )
}

pub struct QueryExecutor<'a> {
    engine: &'a QueryEngine,
    ctx: &'a QueryContext,
    plan: &'a ExecPlan,
    bind_variables: &'a BindVariables,
    transaction_id: Option<i64>,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        engine: &'a QueryEngine,
        ctx: &'a QueryContext,
        plan: &'a ExecPlan,
        bind_variables: &'a BindVariables,
        transaction_id: Option<i64>,
    ) -> Self {
        Self {
            engine,
            ctx,
            plan,
            bind_variables,
            transaction_id,
        }
    }

    pub async fn execute(&self) -> Result<QueryResult> {
        if self.plan.plan_type == PlanType::Ddl {
            return self.exec_ddl().await;
        }
        if let Some(id) = self.transaction_id {
            let mut tx = self.engine.tx_pool.lock(id)?;
            let result = self.exec_in_transaction(&mut tx).await;
            self.release(&mut tx);
            return result;
        }
        match self.plan.plan_type {
            PlanType::PassSelect => {
                if self.plan.reason == Reason::Lock {
                    return Err(disallowed_outside_transaction());
                }
                let sql = self.generate(&self.plan.full_query, &self.row_bound())?;
                let result = self.exec_pooled(&sql).await?;
                self.check_row_count(&result)?;
                Ok(result)
            }
            PlanType::PkIn => self.exec_pk_in().await,
            PlanType::SelectSubquery => self.exec_select_subquery().await,
            PlanType::Set => {
                if self.apply_tunable()? {
                    return Ok(QueryResult::default());
                }
                let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
                self.exec_pooled(&sql).await
            }
            PlanType::Other => {
                let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
                self.exec_pooled(&sql).await
            }
            _ => self.exec_autocommit().await,
        }
    }

    /// Run a select on the stream pool, delivering the fields first and then
    /// rows in chunks of roughly `stream_buffer_size` bytes.
    pub async fn stream(
        &self,
        send_reply: &mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> Result<()> {
        if !self.plan.plan_type.is_select() {
            return Err(TabletError::new(
                ErrorCode::UnsupportedQuery,
                format!("cannot stream a {} statement", self.plan.plan_type),
            ));
        }
        if self.plan.reason == Reason::Lock {
            return Err(disallowed_outside_transaction());
        }
        // Streams are not bounded by max_result_size.
        let bound = InternalBinds::default().with_max_limit(u64::MAX);
        let sql = self.generate(&self.plan.full_query, &bound)?;
        let result = {
            let mut conn = self
                .engine
                .stream_pool
                .get(self.acquire_timeout())
                .await?;
            self.run(&mut conn, &sql, None).await?
        };

        send_reply(QueryResult::with_rows(result.fields, Vec::new()))?;
        let budget = self.engine.tunables.stream_buffer_size();
        let mut chunk = Vec::new();
        let mut size = 0;
        for row in result.rows {
            size += row.iter().map(Value::byte_size).sum::<usize>();
            chunk.push(row);
            if size >= budget {
                send_reply(QueryResult::with_rows(Vec::new(), std::mem::take(&mut chunk)))?;
                size = 0;
            }
        }
        if !chunk.is_empty() {
            send_reply(QueryResult::with_rows(Vec::new(), chunk))?;
        }
        Ok(())
    }

    async fn exec_in_transaction(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        match self.plan.plan_type {
            // Reads see the transaction's own writes, so they bypass the row cache.
            PlanType::PassSelect | PlanType::PkIn | PlanType::SelectSubquery => {
                let sql = self.generate(&self.plan.full_query, &self.row_bound())?;
                let result = self.run_tx(tx, &sql).await?;
                self.check_row_count(&result)?;
                Ok(result)
            }
            PlanType::Set => {
                if self.apply_tunable()? {
                    return Ok(QueryResult::default());
                }
                let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
                self.run_tx(tx, &sql).await
            }
            PlanType::Other => {
                let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
                self.run_tx(tx, &sql).await
            }
            _ => self.exec_dml(tx).await,
        }
    }

    /// DML outside a transaction runs in one of its own when autocommit is on.
    async fn exec_autocommit(&self) -> Result<QueryResult> {
        if !self.engine.config.enable_autocommit {
            return Err(TabletError::new(
                ErrorCode::DisallowedOutsideTransaction,
                "DMLs not allowed outside of transactions",
            ));
        }
        let tx_pool = &self.engine.tx_pool;
        let id = tx_pool.begin().await?;
        let result = match tx_pool.lock(id) {
            Ok(mut tx) => {
                let result = self.exec_dml(&mut tx).await;
                self.release(&mut tx);
                result
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(result) => {
                self.engine.commit(id).await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = tx_pool.rollback(id).await {
                    debug!(target: "tx", transaction_id = id, error = %rollback, "autocommit rollback skipped");
                }
                Err(e)
            }
        }
    }

    async fn exec_dml(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        match self.plan.plan_type {
            PlanType::PassDml => self.exec_pass_dml(tx).await,
            PlanType::DmlPk => {
                let pk_rows = self.pk_rows_from_where()?;
                self.exec_pk_rows(tx, pk_rows).await
            }
            PlanType::DmlSubquery => self.exec_dml_subquery(tx).await,
            PlanType::InsertPk => self.exec_insert_pk(tx).await,
            PlanType::InsertSubquery => self.exec_insert_subquery(tx).await,
            PlanType::UpsertPk => self.exec_upsert(tx).await,
            other => Err(TabletError::new(
                ErrorCode::Internal,
                format!("unexpected plan type {} for dml", other),
            )),
        }
    }

    async fn exec_pk_in(&self) -> Result<QueryResult> {
        let table = self.table()?;
        let pk_rows = dedupe(self.pk_rows_from_where()?);
        let limit = match &self.plan.limit {
            Some(expr) => Some(limit_value(&expr.resolve(self.bind_variables)?)?),
            None => None,
        };
        if limit == Some(0) {
            return Ok(QueryResult::with_rows(self.plan.fields.clone(), Vec::new()));
        }
        let mut rows = self.fetch_rows(table, &pk_rows).await?;
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(self.project(rows))
    }

    async fn exec_select_subquery(&self) -> Result<QueryResult> {
        let table = self.table()?;
        let subquery = self.query_part(&self.plan.subquery, "subquery")?;
        let sql = self.generate(subquery, &self.row_bound())?;
        let inner = self.exec_pooled(&sql).await?;
        self.check_row_count(&inner)?;
        let pk_rows: Vec<Vec<Value>> = inner
            .rows
            .into_iter()
            .map(|row| table.normalize_pk(row))
            .collect();
        let rows = self.fetch_rows(table, &pk_rows).await?;
        Ok(self.project(rows))
    }

    /// Full rows for `pk_rows`, in key order.
    async fn fetch_rows(&self, table: &Table, pk_rows: &[Vec<Value>]) -> Result<Vec<Row>> {
        if pk_rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut fetcher = PoolFetcher { exec: self, table };
        match &self.engine.row_cache {
            Some(cache) if table.is_cached() => {
                let ratio = self.engine.tunables.spot_check_ratio();
                cache.read_through(table, pk_rows, ratio, &mut fetcher).await
            }
            _ => {
                let rows = fetcher.fetch(pk_rows).await?;
                Ok(order_by_keys(table, pk_rows, rows))
            }
        }
    }

    fn project(&self, rows: Vec<Row>) -> QueryResult {
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|row| {
                self.plan
                    .column_numbers
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        let mut result = QueryResult::with_rows(self.plan.fields.clone(), rows);
        result.rows_affected = result.rows.len() as u64;
        result
    }

    async fn exec_pass_dml(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        if self.engine.tunables.strict_mode() {
            return Err(
                TabletError::new(ErrorCode::DmlTooComplex, "DML too complex").with_context(
                    ErrorContext::Plan {
                        plan: Some(self.plan.plan_type.to_string()),
                        table: self.plan.table_name.clone(),
                        reason: self.plan.reason.to_string(),
                    },
                ),
            );
        }
        let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
        let result = self.run_tx(tx, &sql).await?;
        // Unknown keys were written: drop everything cached for the table.
        for name in &self.plan.tables {
            if self
                .engine
                .schema
                .get_table(name)
                .map_or(false, |t| t.is_cached())
            {
                tx.dirty.add_table(name);
            }
        }
        Ok(result)
    }

    async fn exec_pk_rows(&self, tx: &mut TxGuard, pk_rows: Vec<Vec<Value>>) -> Result<QueryResult> {
        if pk_rows.is_empty() {
            return Ok(QueryResult::default());
        }
        let table = self.table()?;
        let secondary = secondary_pk_rows(
            &pk_rows,
            &self.plan.secondary_pk_values,
            self.bind_variables,
        )?
        .map(|rows| {
            rows.into_iter()
                .map(|row| table.normalize_pk(row))
                .collect::<Vec<_>>()
        });
        let outer = self.query_part(&self.plan.outer_query, "outer query")?;
        let mut sql = self.generate(outer, &pk_binds(table, &pk_rows))?;
        sql.push_str(&stream_comment(table, &pk_rows, secondary.as_deref()));
        let result = self.run_tx(tx, &sql).await?;
        tx.dirty.add(&table.name, pk_rows);
        if let Some(secondary) = secondary {
            tx.dirty.add(&table.name, secondary);
        }
        Ok(result)
    }

    async fn exec_dml_subquery(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        let table = self.table()?;
        let subquery = self.query_part(&self.plan.subquery, "subquery")?;
        let max_rows = self.engine.tunables.max_dml_rows();
        let bound = InternalBinds::default().with_max_limit(max_rows as u64 + 1);
        let sql = self.generate(subquery, &bound)?;
        let inner = self.run_tx(tx, &sql).await?;
        let mut pk_rows: Vec<Vec<Value>> = inner
            .rows
            .into_iter()
            .map(|row| table.normalize_pk(row))
            .collect();
        let partial = pk_rows.len() > max_rows;
        if partial {
            pk_rows.truncate(max_rows);
            self.engine.stats.partial_dml.inc();
            warn!(
                target: "queries",
                table = %table.name,
                limit = max_rows,
                "dml stopped at the row limit, more rows may match"
            );
        }
        let mut result = self.exec_pk_rows(tx, pk_rows).await?;
        result.partial = partial;
        Ok(result)
    }

    async fn exec_insert_pk(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        let table = self.table()?;
        let pk_rows = self.pk_rows_from_values()?;
        let outer = self.query_part(&self.plan.outer_query, "outer query")?;
        let mut sql = self.generate(outer, &InternalBinds::default())?;
        sql.push_str(&stream_comment(table, &pk_rows, None));
        let result = self.run_tx(tx, &sql).await?;
        tx.dirty
            .add(&table.name, fill_auto_increment(table, pk_rows, result.insert_id));
        Ok(result)
    }

    async fn exec_insert_subquery(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        let table = self.table()?;
        let subquery = self.query_part(&self.plan.subquery, "subquery")?;
        let sql = self.generate(subquery, &self.row_bound())?;
        let inner = self.run_tx(tx, &sql).await?;
        self.check_row_count(&inner)?;
        if inner.rows.is_empty() {
            return Ok(QueryResult::default());
        }

        let mut pk_rows = Vec::with_capacity(inner.rows.len());
        for row in &inner.rows {
            if row.len() != self.plan.insert_column_count {
                return Err(TabletError::new(
                    ErrorCode::SyntaxError,
                    "Column count doesn't match value count",
                ));
            }
            let pk = self
                .plan
                .subquery_pk_positions
                .iter()
                .zip(&table.pk_columns)
                .map(|(position, &column)| match position {
                    Some(p) => row[*p].clone(),
                    None => table.columns[column].default.clone(),
                })
                .collect();
            pk_rows.push(table.normalize_pk(pk));
        }

        let outer = self.query_part(&self.plan.outer_query, "outer query")?;
        let mut sql = self.generate(outer, &InternalBinds::default().with_values(inner.rows))?;
        sql.push_str(&stream_comment(table, &pk_rows, None));
        let result = self.run_tx(tx, &sql).await?;
        tx.dirty
            .add(&table.name, fill_auto_increment(table, pk_rows, result.insert_id));
        Ok(result)
    }

    async fn exec_upsert(&self, tx: &mut TxGuard) -> Result<QueryResult> {
        let table = self.table()?;
        let pk_rows = self.pk_rows_from_values()?;
        let comment = stream_comment(table, &pk_rows, None);

        let outer = self.query_part(&self.plan.outer_query, "outer query")?;
        let mut sql = self.generate(outer, &InternalBinds::default())?;
        sql.push_str(&comment);
        let err = match self.run_tx(tx, &sql).await {
            Ok(result) => {
                tx.dirty
                    .add(&table.name, fill_auto_increment(table, pk_rows, result.insert_id));
                return Ok(result);
            }
            Err(e) => e,
        };
        if err.sql_errno() != Some(mysql::ER_DUP_ENTRY) {
            return Err(err);
        }
        match self
            .engine
            .conflict_parser
            .parse_conflict(mysql::ER_DUP_ENTRY, &err.message)
        {
            Some(key) if key.is_primary() => {
                debug!(target: "queries", table = %table.name, "primary key conflict, updating instead");
            }
            _ => return Err(err),
        }

        let upsert = self.query_part(&self.plan.upsert_query, "upsert query")?;
        let mut sql = self.generate(upsert, &pk_binds(table, &pk_rows))?;
        sql.push_str(&comment);
        let mut result = self.run_tx(tx, &sql).await?;
        // A conflicting insert counts the row once when nothing changed and
        // twice when the update changed it.
        result.rows_affected = match result.rows_affected {
            0 => 1,
            n => n * 2,
        };
        tx.dirty.add(&table.name, pk_rows);
        Ok(result)
    }

    async fn exec_ddl(&self) -> Result<QueryResult> {
        let sql = self.generate(&self.plan.full_query, &InternalBinds::default())?;
        let tx_pool = &self.engine.tx_pool;
        let id = tx_pool.begin().await?;
        let result = match tx_pool.lock(id) {
            Ok(mut tx) => {
                let result = self.run_tx(&mut tx, &sql).await;
                self.release(&mut tx);
                result
            }
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                if let Err(rollback) = tx_pool.rollback(id).await {
                    debug!(target: "tx", transaction_id = id, error = %rollback, "ddl rollback skipped");
                }
                return Err(e);
            }
        };
        tx_pool.commit(id, &mut DirtyKeys::default()).await?;
        self.refresh_schema_after_ddl();
        Ok(result)
    }

    /// Forget dropped or renamed tables now, and re-read the new definition
    /// in the background.
    fn refresh_schema_after_ddl(&self) {
        let Some(ddl) = &self.plan.ddl else {
            return;
        };
        let schema = &self.engine.schema;
        if let Some(old) = &ddl.table_name {
            if ddl.new_name.as_deref() != Some(old.as_str()) {
                schema.drop_table(old);
            }
            self.bump_generation(old);
        }
        if let Some(new) = &ddl.new_name {
            self.bump_generation(new);
            let schema = Arc::clone(schema);
            let name = new.clone();
            tokio::spawn(async move {
                if let Err(e) = schema.create_or_update_table(&name).await {
                    warn!(target: "schema", table = %name, error = %e, "cannot reload table after ddl");
                }
            });
        }
    }

    fn bump_generation(&self, table: &str) {
        if let Some(cache) = &self.engine.row_cache {
            cache.bump_generation(table);
        }
    }

    fn apply_tunable(&self) -> Result<bool> {
        match &self.plan.set {
            Some(set) => {
                let value = set.value.resolve(self.bind_variables)?;
                self.engine.tunables.apply(&set.key, &value)
            }
            None => Ok(false),
        }
    }

    async fn exec_pooled(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.engine.conn_pool.get(self.acquire_timeout()).await?;
        self.run(&mut conn, sql, None).await
    }

    async fn run_tx(&self, tx: &mut TxGuard, sql: &str) -> Result<QueryResult> {
        let kill = tx.kill_token().clone();
        self.run(&mut tx.conn, sql, Some(&kill)).await
    }

    /// Execute one statement, racing it against cancellation, the statement
    /// timeout and the transaction kill signal.
    async fn run(
        &self,
        conn: &mut PooledConn,
        sql: &str,
        kill: Option<&CancellationToken>,
    ) -> Result<QueryResult> {
        let never = CancellationToken::new();
        let kill = kill.unwrap_or(&never);
        let timeout = self.statement_timeout();
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        let outcome = tokio::select! {
            result = conn.execute(sql) => Ok(result),
            _ = self.ctx.cancelled() => Err(Abort::Cancelled),
            _ = deadline => Err(Abort::TimedOut(timeout.unwrap_or_default())),
            _ = kill.cancelled() => Err(Abort::Killed),
        };
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                if matches!(
                    e.number,
                    mysql::CR_SERVER_GONE_ERROR | mysql::CR_SERVER_LOST
                ) {
                    conn.taint();
                }
                Err(e.into())
            }
            Err(abort) => {
                conn.taint();
                let err = abort.into_error();
                warn!(target: "queries", pool = conn.pool_name(), error = %err, "statement aborted");
                Err(err)
            }
        }
    }

    /// A transaction whose connection was closed cannot continue.
    fn release(&self, tx: &mut TxGuard) {
        if tx.conn.is_tainted() {
            self.engine.tx_pool.discard(tx);
        }
    }

    fn statement_timeout(&self) -> Option<Duration> {
        match (self.engine.tunables.query_timeout(), self.ctx.remaining()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn acquire_timeout(&self) -> Duration {
        let pool_timeout = self.engine.config.pool_timeout();
        self.ctx
            .remaining()
            .map_or(pool_timeout, |r| r.min(pool_timeout))
    }

    fn check_row_count(&self, result: &QueryResult) -> Result<()> {
        let max = self.engine.tunables.max_result_size();
        if result.rows.len() > max {
            return Err(TabletError::new(
                ErrorCode::RowCountExceeded,
                format!("Row count exceeded {}", max),
            )
            .with_context(ErrorContext::RowLimit { limit: max }));
        }
        Ok(())
    }

    fn row_bound(&self) -> InternalBinds {
        InternalBinds::default().with_max_limit(self.engine.tunables.max_result_size() as u64 + 1)
    }

    fn generate(&self, query: &ParsedQuery, internal: &InternalBinds) -> Result<String> {
        Ok(query.generate(self.bind_variables, internal)?)
    }

    fn table(&self) -> Result<&'a Arc<Table>> {
        self.plan.table.as_ref().ok_or_else(|| {
            TabletError::new(
                ErrorCode::Internal,
                format!("{} plan without a table", self.plan.plan_type),
            )
        })
    }

    fn query_part<'q>(&self, part: &'q Option<ParsedQuery>, what: &str) -> Result<&'q ParsedQuery> {
        part.as_ref().ok_or_else(|| {
            TabletError::new(
                ErrorCode::Internal,
                format!("{} plan without {}", self.plan.plan_type, what),
            )
        })
    }

    fn pk_rows_from_where(&self) -> Result<Vec<Vec<Value>>> {
        let table = self.table()?;
        Ok(resolve_pk_rows(&self.plan.pk_values, self.bind_variables)?
            .into_iter()
            .map(|row| table.normalize_pk(row))
            .collect())
    }

    fn pk_rows_from_values(&self) -> Result<Vec<Vec<Value>>> {
        let table = self.table()?;
        Ok(resolve_value_rows(&self.plan.pk_rows, self.bind_variables)?
            .into_iter()
            .map(|row| table.normalize_pk(row))
            .collect())
    }
}

/// Loads rows by key on the non-transactional pool.
struct PoolFetcher<'e> {
    exec: &'e QueryExecutor<'e>,
    table: &'e Table,
}

#[async_trait]
impl<'e> RowFetcher for PoolFetcher<'e> {
    async fn fetch(&mut self, pk_rows: &[Vec<Value>]) -> Result<Vec<Row>> {
        if pk_rows.is_empty() {
            return Ok(Vec::new());
        }
        let outer = self
            .exec
            .query_part(&self.exec.plan.outer_query, "outer query")?;
        let sql = self.exec.generate(outer, &pk_binds(self.table, pk_rows))?;
        Ok(self.exec.exec_pooled(&sql).await?.rows)
    }
}

fn pk_binds(table: &Table, pk_rows: &[Vec<Value>]) -> InternalBinds {
    let columns = table
        .pk_column_names()
        .into_iter()
        .map(String::from)
        .collect();
    InternalBinds::default().with_pk(TupleEqualityList::new(columns, pk_rows.to_vec()))
}

fn dedupe(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
    for row in rows {
        if !out.contains(&row) {
            out.push(row);
        }
    }
    out
}

fn limit_value(value: &Value) -> Result<usize> {
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(TabletError::new(
            ErrorCode::SyntaxError,
            format!("invalid limit value: {}", value.to_sql()),
        )),
    }
}

/// Keys of inserted rows, with NULL auto-increment values replaced by the
/// ids the database assigned.
/// Ids are handed out consecutively from `insert_id`, one per row that left
/// its auto-increment column NULL. Rows with explicit ids take none.
fn fill_auto_increment(table: &Table, pk_rows: Vec<Vec<Value>>, insert_id: u64) -> Vec<Vec<Value>> {
    if insert_id == 0 {
        return pk_rows;
    }
    let mut next = insert_id;
    pk_rows
        .into_iter()
        .map(|mut row| {
            let mut generated = false;
            for (value, &column) in row.iter_mut().zip(&table.pk_columns) {
                if value.is_null() && table.columns[column].is_auto_increment {
                    *value = Value::Uint64(next);
                    generated = true;
                }
            }
            if generated {
                next += 1;
            }
            table.normalize_pk(row)
        })
        .collect()
}
