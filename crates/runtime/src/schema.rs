//! Schema cache and plan cache.
//!
//! `SchemaInfo` holds the tables of the database the tablet fronts and the
//! plans built against them. Plans are cached by statement text; a plan is
//! only ever cached after it was built successfully, and every plan that
//! references a table is purged when that table changes.
//!
//! Table metadata comes from a [`SchemaSource`]: the database itself
//! ([`DbSchemaSource`]) or a YAML file ([`StaticSchemaSource`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::RwLock;
use tablet_common::config::SchemaOverride;
use tablet_common::{FieldType, Value};
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tablet_sql::{build_plan, CacheType, ExecPlan, Table, TableColumn, TableDef};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::ConnPool;

/// Table comments containing this marker opt the table out of the row cache.
pub const NOCACHE_MARKER: &str = "vtocc_nocache";

#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_tables(&self) -> Result<Vec<Table>>;

    /// Load one table, `None` when it does not exist.
    async fn load_table(&self, name: &str) -> Result<Option<Table>>;
}

/// Tables read from a fixed definition list.
#[derive(Default)]
pub struct StaticSchemaSource {
    tables: RwLock<Vec<Table>>,
}

impl StaticSchemaSource {
    pub fn new(tables: Vec<Table>) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub fn from_defs(defs: Vec<TableDef>) -> Result<Self> {
        let tables = defs
            .into_iter()
            .map(|def| def.into_table().map_err(schema_error))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(tables))
    }

    /// Parse a YAML list of table definitions.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let defs: Vec<TableDef> = serde_yaml::from_str(yaml)?;
        Self::from_defs(defs)
    }

    pub fn load_file(path: &str) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            TabletError::new(ErrorCode::SchemaLoadFailed, e.to_string()).with_context(
                ErrorContext::Config {
                    file_path: Some(path.to_string()),
                    field: None,
                },
            )
        })?;
        Self::from_yaml(&yaml)
    }

    /// Replace or add a table, as a DDL would.
    pub fn put_table(&self, table: Table) {
        let mut tables = self.tables.write();
        tables.retain(|t| t.name != table.name);
        tables.push(table);
    }

    pub fn remove_table(&self, name: &str) {
        self.tables.write().retain(|t| t.name != name);
    }

    pub fn tables(&self) -> Vec<Table> {
        self.tables.read().clone()
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn load_tables(&self) -> Result<Vec<Table>> {
        Ok(self.tables.read().clone())
    }

    async fn load_table(&self, name: &str) -> Result<Option<Table>> {
        Ok(self.tables.read().iter().find(|t| t.name == name).cloned())
    }
}

fn schema_error(message: impl Into<String>) -> TabletError {
    TabletError::new(ErrorCode::SchemaLoadFailed, message)
}

const BASE_TABLE_QUERY: &str = "select table_name, table_type, unix_timestamp(create_time), table_comment from information_schema.tables where table_schema = database()";

/// Reads table metadata from `information_schema`, `describe` and
/// `show index`.
pub struct DbSchemaSource {
    pool: ConnPool,
    timeout: Duration,
}

impl DbSchemaSource {
    pub fn new(pool: ConnPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let mut conn = self.pool.get(self.timeout).await?;
        let result = conn.execute(sql).await.map_err(|e| {
            schema_error(format!("{}: {}", sql, e)).with_sql_error(e.number, e.state.clone())
        })?;
        Ok(result.rows)
    }

    async fn load_details(&self, row: &[Value]) -> Result<Option<Table>> {
        let name = text(row.first());
        if text(row.get(1)) != "BASE TABLE" {
            return Ok(None);
        }
        let mut table = Table::new(name.clone());
        table.create_time = row.get(2).and_then(Value::as_i64).unwrap_or(0);
        table.comment = text(row.get(3));

        // Field, Type, Null, Key, Default, Extra
        for col in self.fetch(&format!("describe `{}`", name)).await? {
            let mut column = TableColumn::new(
                text(col.first()),
                FieldType::from_mysql_type(&text(col.get(1))),
            );
            column.default = col.get(4).cloned().unwrap_or(Value::Null);
            column.is_auto_increment = text(col.get(5)).contains("auto_increment");
            table.add_column(column);
        }

        // Table, Non_unique, Key_name, Seq_in_index, Column_name, ...
        let pk: Vec<String> = self
            .fetch(&format!("show index from `{}`", name))
            .await?
            .iter()
            .filter(|idx| text(idx.get(2)) == "PRIMARY")
            .map(|idx| text(idx.get(4)))
            .collect();
        if !pk.is_empty() {
            table.set_pk(&pk).map_err(schema_error)?;
            table.cache_type = CacheType::ReadWrite;
        }
        Ok(Some(table))
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Text(s)) | Some(Value::Decimal(s)) => s.clone(),
        Some(Value::Binary(b)) => String::from_utf8_lossy(b).into_owned(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_sql(),
    }
}

#[async_trait]
impl SchemaSource for DbSchemaSource {
    async fn load_tables(&self) -> Result<Vec<Table>> {
        let mut tables = Vec::new();
        for row in self.fetch(BASE_TABLE_QUERY).await? {
            if let Some(table) = self.load_details(&row).await? {
                tables.push(table);
            }
        }
        Ok(tables)
    }

    async fn load_table(&self, name: &str) -> Result<Option<Table>> {
        let mut escaped = String::new();
        tablet_common::types::encode_string(name, &mut escaped);
        let sql = format!("{} and table_name = {}", BASE_TABLE_QUERY, escaped);
        match self.fetch(&sql).await?.first() {
            Some(row) => self.load_details(row).await,
            None => Ok(None),
        }
    }
}

pub struct SchemaInfo {
    source: Arc<dyn SchemaSource>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    plans: Cache<String, Arc<ExecPlan>>,
    /// Bumped whenever cached plans are purged.
    plan_generation: AtomicU64,
    overrides: Vec<SchemaOverride>,
    row_cache_enabled: bool,
    reloader: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SchemaInfo {
    pub fn new(
        source: Arc<dyn SchemaSource>,
        query_cache_size: u64,
        overrides: Vec<SchemaOverride>,
        row_cache_enabled: bool,
    ) -> Self {
        Self {
            source,
            tables: RwLock::new(HashMap::new()),
            plans: Cache::new(query_cache_size),
            plan_generation: AtomicU64::new(0),
            overrides,
            row_cache_enabled,
            reloader: parking_lot::Mutex::new(None),
        }
    }

    /// Apply overrides and decide cache eligibility. A source marks the
    /// tables it considers cacheable; an override may decide either way.
    fn prepare(&self, mut table: Table) -> Table {
        let ov = self.overrides.iter().find(|o| o.name == table.name);
        if let Some(ov) = ov {
            if !ov.pk_columns.is_empty() {
                if let Err(e) = table.set_pk(&ov.pk_columns) {
                    warn!(target: "schema", table = %table.name, error = %e, "ignoring primary key override");
                }
            }
        }
        let wanted = match ov.and_then(|o| o.cache) {
            Some(cache) => cache,
            None => table.cache_type == CacheType::ReadWrite,
        };
        let cacheable = self.row_cache_enabled
            && wanted
            && table.has_pk()
            && !table.comment.contains(NOCACHE_MARKER);
        table.cache_type = if cacheable {
            CacheType::ReadWrite
        } else {
            CacheType::None
        };
        table
    }

    /// Load every table, replacing whatever was known.
    pub async fn open(&self) -> Result<()> {
        let tables = self.source.load_tables().await?;
        let mut map = HashMap::with_capacity(tables.len());
        for table in tables {
            let table = self.prepare(table);
            map.insert(table.name.clone(), Arc::new(table));
        }
        info!(target: "schema", tables = map.len(), "schema loaded");
        *self.tables.write() = map;
        self.clear_plans();
        Ok(())
    }

    /// Reload and return the names of tables that changed or disappeared.
    pub async fn reload(&self) -> Result<Vec<String>> {
        let loaded = self.source.load_tables().await?;
        let mut changed = Vec::new();
        let mut fresh = HashMap::with_capacity(loaded.len());
        {
            let current = self.tables.read();
            for table in loaded {
                let table = self.prepare(table);
                if current.get(&table.name).map(|t| t.as_ref()) != Some(&table) {
                    changed.push(table.name.clone());
                }
                fresh.insert(table.name.clone(), Arc::new(table));
            }
            for name in current.keys() {
                if !fresh.contains_key(name) {
                    changed.push(name.clone());
                }
            }
        }
        *self.tables.write() = fresh;
        for name in &changed {
            self.purge_plans(name);
        }
        if !changed.is_empty() {
            info!(target: "schema", changed = ?changed, "schema reloaded");
        }
        Ok(changed)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached plan for `sql`, building it on a miss.
    pub fn get_plan(&self, sql: &str) -> Result<Arc<ExecPlan>> {
        if let Some(plan) = self.plans.get(sql) {
            return Ok(plan);
        }
        let generation = self.plan_generation();
        let lookup = |name: &str| self.get_table(name);
        let plan = Arc::new(build_plan(sql, &lookup)?);
        self.cache_plan(sql, plan.clone(), generation);
        Ok(plan)
    }

    fn plan_generation(&self) -> u64 {
        self.plan_generation.load(Ordering::Acquire)
    }

    /// Cache a plan built from tables read at `generation`, unless a purge
    /// ran since. A purge racing the insert is caught by the second check.
    fn cache_plan(&self, sql: &str, plan: Arc<ExecPlan>, generation: u64) {
        if self.plan_generation() != generation {
            debug!(target: "schema", sql, "plan outdated by a schema change, not cached");
            return;
        }
        self.plans.insert(sql.to_string(), plan);
        if self.plan_generation() != generation {
            self.plans.invalidate(sql);
        }
    }

    pub fn plan_count(&self) -> u64 {
        self.plans.run_pending_tasks();
        self.plans.entry_count()
    }

    pub fn clear_plans(&self) {
        self.plan_generation.fetch_add(1, Ordering::AcqRel);
        self.plans.invalidate_all();
    }

    /// Callers update `tables` first.
    fn purge_plans(&self, table: &str) {
        self.plan_generation.fetch_add(1, Ordering::AcqRel);
        let stale: Vec<Arc<String>> = self
            .plans
            .iter()
            .filter(|(_, plan)| {
                plan.table_name.as_deref() == Some(table) || plan.tables.iter().any(|t| t == table)
            })
            .map(|(sql, _)| sql)
            .collect();
        for sql in stale {
            self.plans.invalidate(sql.as_str());
        }
    }

    pub fn drop_table(&self, name: &str) {
        if self.tables.write().remove(name).is_some() {
            debug!(target: "schema", table = name, "table dropped");
        }
        self.purge_plans(name);
    }

    /// Re-read one table from the source after a DDL.
    pub async fn create_or_update_table(&self, name: &str) -> Result<()> {
        match self.source.load_table(name).await? {
            Some(table) => {
                let table = self.prepare(table);
                self.tables.write().insert(name.to_string(), Arc::new(table));
                debug!(target: "schema", table = name, "table reloaded");
            }
            None => {
                self.tables.write().remove(name);
            }
        }
        self.purge_plans(name);
        Ok(())
    }

    /// Start a background reload every `interval`. `on_change` receives the
    /// names of tables whose definition changed.
    pub fn start_reloader<F>(self: &Arc<Self>, interval: Duration, on_change: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        let schema = Arc::clone(self);
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => match schema.reload().await {
                        Ok(changed) if !changed.is_empty() => on_change(&changed),
                        Ok(_) => {}
                        Err(e) => warn!(target: "schema", error = %e, "schema reload failed"),
                    },
                }
            }
        });
        if let Some((old, _)) = self.reloader.lock().replace((token, handle)) {
            old.cancel();
        }
    }

    pub fn stop_reloader(&self) {
        if let Some((token, _)) = self.reloader.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rows_result, FakeDb};
    use tablet_common::QueryResult;
    use tablet_sql::PlanType;

    const SCHEMA: &str = r#"
- name: test_table
  columns:
    - { name: pk, type: int }
    - { name: name, type: varchar(64) }
  primary_key: [pk]
  cache: true
- name: quiet
  columns:
    - { name: id, type: bigint }
  primary_key: [id]
  comment: "vtocc_nocache"
"#;

    fn schema(row_cache: bool, overrides: Vec<SchemaOverride>) -> (Arc<StaticSchemaSource>, SchemaInfo) {
        let source = Arc::new(StaticSchemaSource::from_yaml(SCHEMA).unwrap());
        let info = SchemaInfo::new(source.clone(), 100, overrides, row_cache);
        (source, info)
    }

    #[tokio::test]
    async fn test_cache_eligibility() {
        let (_, info) = schema(true, vec![]);
        info.open().await.unwrap();
        assert!(info.get_table("test_table").unwrap().is_cached());
        assert!(!info.get_table("quiet").unwrap().is_cached());

        let (_, info) = schema(false, vec![]);
        info.open().await.unwrap();
        assert!(!info.get_table("test_table").unwrap().is_cached());

        let (_, info) = schema(
            true,
            vec![SchemaOverride {
                name: "test_table".into(),
                pk_columns: vec![],
                cache: Some(false),
            }],
        );
        info.open().await.unwrap();
        assert!(!info.get_table("test_table").unwrap().is_cached());
    }

    #[tokio::test]
    async fn test_pk_override() {
        let (_, info) = schema(
            true,
            vec![SchemaOverride {
                name: "test_table".into(),
                pk_columns: vec!["name".into()],
                cache: None,
            }],
        );
        info.open().await.unwrap();
        assert_eq!(info.get_table("test_table").unwrap().pk_column_names(), vec!["name"]);
    }

    #[tokio::test]
    async fn test_plans_cached_only_on_success() {
        let (_, info) = schema(true, vec![]);
        info.open().await.unwrap();
        let a = info.get_plan("select * from test_table where pk = 1").unwrap();
        let b = info.get_plan("select * from test_table where pk = 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.plan_type, PlanType::PkIn);

        assert!(info.get_plan("selec * from test_table").is_err());
        assert_eq!(info.plan_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_purges_changed_tables() {
        let (source, info) = schema(true, vec![]);
        info.open().await.unwrap();
        info.get_plan("select * from test_table where pk = 1").unwrap();
        info.get_plan("select * from quiet where id = 1").unwrap();

        let mut table = (*info.get_table("test_table").unwrap()).clone();
        table.add_column(TableColumn::new("extra", FieldType::Int32));
        source.put_table(table);

        assert_eq!(info.reload().await.unwrap(), vec!["test_table".to_string()]);
        assert_eq!(info.plan_count(), 1);
        assert_eq!(info.get_table("test_table").unwrap().columns.len(), 3);
    }

    #[tokio::test]
    async fn test_plan_built_before_table_change_is_not_cached() {
        let (_, info) = schema(true, vec![]);
        info.open().await.unwrap();
        let sql = "select * from test_table where pk = 1";

        let generation = info.plan_generation();
        let lookup = |name: &str| info.get_table(name);
        let stale = Arc::new(build_plan(sql, &lookup).unwrap());
        info.drop_table("test_table");
        info.cache_plan(sql, stale, generation);
        assert_eq!(info.plan_count(), 0);

        // Plans built after the change are cached as usual.
        info.create_or_update_table("test_table").await.unwrap();
        let generation = info.plan_generation();
        let fresh = Arc::new(build_plan(sql, &lookup).unwrap());
        info.cache_plan(sql, fresh, generation);
        assert_eq!(info.plan_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_and_recreate() {
        let (source, info) = schema(true, vec![]);
        info.open().await.unwrap();
        info.get_plan("select * from test_table where pk = 1").unwrap();

        info.drop_table("test_table");
        assert!(info.get_table("test_table").is_none());
        assert_eq!(info.plan_count(), 0);

        info.create_or_update_table("test_table").await.unwrap();
        assert!(info.get_table("test_table").is_some());

        source.remove_table("test_table");
        info.create_or_update_table("test_table").await.unwrap();
        assert!(info.get_table("test_table").is_none());
    }

    #[tokio::test]
    async fn test_db_source() {
        let db = FakeDb::new();
        db.add_query(
            BASE_TABLE_QUERY,
            QueryResult::with_rows(
                vec![],
                vec![
                    vec![
                        Value::Text("test_table".into()),
                        Value::Text("BASE TABLE".into()),
                        Value::Int64(1427325875),
                        Value::Text("".into()),
                    ],
                    vec![
                        Value::Text("v".into()),
                        Value::Text("VIEW".into()),
                        Value::Null,
                        Value::Text("".into()),
                    ],
                ],
            ),
        );
        db.add_query(
            "describe `test_table`",
            rows_result(
                &[("Field", FieldType::VarChar), ("Type", FieldType::VarChar)],
                vec![
                    vec![
                        Value::Text("pk".into()),
                        Value::Text("int(11)".into()),
                        Value::Text("NO".into()),
                        Value::Text("PRI".into()),
                        Value::Null,
                        Value::Text("auto_increment".into()),
                    ],
                    vec![
                        Value::Text("name".into()),
                        Value::Text("varchar(10)".into()),
                        Value::Text("YES".into()),
                        Value::Text("".into()),
                        Value::Text("x".into()),
                        Value::Text("".into()),
                    ],
                ],
            ),
        );
        db.add_query(
            "show index from `test_table`",
            QueryResult::with_rows(
                vec![],
                vec![vec![
                    Value::Text("test_table".into()),
                    Value::Int64(0),
                    Value::Text("PRIMARY".into()),
                    Value::Int64(1),
                    Value::Text("pk".into()),
                ]],
            ),
        );

        let pool = ConnPool::new("schema", 1, Duration::from_secs(60), Arc::new(db));
        let source = DbSchemaSource::new(pool, Duration::from_secs(1));
        let tables = source.load_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.create_time, 1427325875);
        assert_eq!(table.pk_column_names(), vec!["pk"]);
        assert!(table.columns[0].is_auto_increment);
        assert_eq!(table.columns[0].column_type, FieldType::Int32);
        assert_eq!(table.columns[1].default, Value::Text("x".into()));
    }
}
