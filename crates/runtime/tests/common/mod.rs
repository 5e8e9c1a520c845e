#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use tablet_common::config::TabletConfig;
use tablet_common::{FieldType, QueryContext, QueryResult, Row, Value};
use tablet_runtime::testing::{rows_result, FakeDb};
use tablet_runtime::{Controller, StaticSchemaSource, TabletServer, TabletType};
use tablet_sql::{CacheType, Table, TableColumn};

pub const TEST_FIELDS: [(&str, FieldType); 3] = [
    ("pk", FieldType::Int64),
    ("name", FieldType::VarChar),
    ("addr", FieldType::VarChar),
];

pub fn test_table() -> Table {
    let mut table = Table::new("test_table");
    table.add_column(TableColumn::new("pk", FieldType::Int64));
    table.add_column(TableColumn::new("name", FieldType::VarChar));
    table.add_column(TableColumn::new("addr", FieldType::VarChar));
    table.set_pk(&["pk"]).expect("pk column exists");
    table.cache_type = CacheType::ReadWrite;
    table
}

pub fn test_config() -> TabletConfig {
    let mut config = TabletConfig::default();
    config.pool_size = 4;
    config.stream_pool_size = 2;
    config.transaction_cap = 4;
    config.pool_timeout_secs = 1.0;
    config.schema_reload_time_secs = 0.0;
    config.row_cache.enabled = true;
    config
}

/// Script the bounded form of `select 1 from dual`.
pub fn add_dual(db: &FakeDb) {
    db.add_query(
        "select 1 from dual limit 10001",
        rows_result(&[("1", FieldType::Int64)], vec![vec![Value::Int64(1)]]),
    );
}

pub fn row(pk: i64, name: &str, addr: &str) -> Row {
    vec![Value::Int64(pk), Value::Text(name.into()), Value::Text(addr.into())]
}

pub fn test_rows(rows: Vec<Row>) -> QueryResult {
    rows_result(&TEST_FIELDS, rows)
}

pub fn pk_rows(pks: &[i64]) -> QueryResult {
    rows_result(
        &[("pk", FieldType::Int64)],
        pks.iter().map(|pk| vec![Value::Int64(*pk)]).collect(),
    )
}

/// A caller identified both by transport and by the router.
pub fn ctx(user: &str) -> QueryContext {
    QueryContext::background()
        .with_call_info("127.0.0.1", user)
        .with_caller_id(user)
}

/// A master tablet serving `test_table` from `db`.
pub async fn start_server(db: &FakeDb, config: TabletConfig) -> Result<TabletServer> {
    let server = TabletServer::builder(config, Arc::new(db.clone()))
        .schema_source(Arc::new(StaticSchemaSource::new(vec![test_table()])))
        .build()?;
    server.start_service(TabletType::Master).await?;
    Ok(server)
}
