mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{ctx, row, start_server, test_config, test_rows, test_table};
use tablet_common::config::TabletConfig;
use tablet_common::{BindVariables, FieldType, QueryResult, Row, Value};
use tablet_runtime::testing::{rows_result, FakeDb};
use tablet_runtime::{Controller, QueryService, StaticSchemaSource, TabletServer, TabletType};
use tablet_sql::{CacheType, Table, TableColumn};

const FETCH_1: &str = "select pk, name, addr from test_table where pk in (1)";
const SELECT_1: &str = "select * from test_table where pk = 1";

fn no_binds() -> BindVariables {
    BindVariables::new()
}

#[tokio::test]
async fn test_repeated_reads_are_served_from_cache() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let first = server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    let second = server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(first.rows, second.rows);
    assert_eq!(db.count(FETCH_1), 1);

    let stats = server.stats();
    assert_eq!(stats.row_cache.with_label_values(&["test_table", "miss"]).get(), 1);
    assert_eq!(stats.row_cache.with_label_values(&["test_table", "hit"]).get(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_rows_are_cached_as_absent() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![]));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    for _ in 0..2 {
        let result = server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
        assert!(result.rows.is_empty());
    }
    assert_eq!(db.count(FETCH_1), 1);
    assert_eq!(
        server
            .stats()
            .row_cache
            .with_label_values(&["test_table", "absent"])
            .get(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_commit_invalidates_written_rows() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    db.add_query(
        "update test_table set name = 'z' where pk in (1) /* _stream test_table (pk ) (1 ); */",
        QueryResult::affected(1),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;

    let id = server.begin(&ctx).await?;
    server
        .execute(&ctx, "update test_table set name = 'z' where pk = 1", &no_binds(), Some(id))
        .await?;
    // Not yet committed: the cached row still answers.
    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(db.count(FETCH_1), 1);

    db.add_query(FETCH_1, test_rows(vec![row(1, "z", "b")]));
    server.commit(&ctx, id).await?;
    let result = server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(result.rows, vec![row(1, "z", "b")]);
    assert_eq!(db.count(FETCH_1), 2);
    Ok(())
}

#[tokio::test]
async fn test_rollback_keeps_cache() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    db.add_query(
        "delete from test_table where pk in (1) /* _stream test_table (pk ) (1 ); */",
        QueryResult::affected(1),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    let id = server.begin(&ctx).await?;
    server
        .execute(&ctx, "delete from test_table where pk = 1", &no_binds(), Some(id))
        .await?;
    server.rollback(&ctx, id).await?;

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(db.count(FETCH_1), 1);
    Ok(())
}

#[tokio::test]
async fn test_reads_inside_transaction_bypass_cache() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    db.add_query(
        "select * from test_table where pk = 1 limit 10001",
        test_rows(vec![row(1, "a", "b")]),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    let id = server.begin(&ctx).await?;
    server.execute(&ctx, SELECT_1, &no_binds(), Some(id)).await?;
    server.commit(&ctx, id).await?;
    assert_eq!(db.count("select * from test_table where pk = 1 limit 10001"), 1);
    Ok(())
}

#[tokio::test]
async fn test_schema_change_invalidates_table() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    let source = Arc::new(StaticSchemaSource::new(vec![test_table()]));
    let server = TabletServer::builder(test_config(), Arc::new(db.clone()))
        .schema_source(source.clone())
        .build()?;
    server.start_service(TabletType::Master).await?;
    let ctx = ctx("dev");

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    server.reload_schema().await?;
    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(db.count(FETCH_1), 1);

    let mut altered = test_table();
    altered.create_time = 42;
    source.put_table(altered);
    server.reload_schema().await?;
    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    assert_eq!(db.count(FETCH_1), 2);
    Ok(())
}

#[tokio::test]
async fn test_spot_check_replaces_stale_rows() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    let mut config = test_config();
    config.row_cache.spot_check_ratio = 1.0;
    let server = start_server(&db, config).await?;
    let ctx = ctx("dev");

    server.execute(&ctx, SELECT_1, &no_binds(), None).await?;
    // Written behind the tablet's back.
    db.add_query(FETCH_1, test_rows(vec![row(1, "changed", "b")]));
    let result = server.execute(&ctx, SELECT_1, &no_binds(), None).await?;

    assert_eq!(result.rows, vec![row(1, "changed", "b")]);
    assert_eq!(server.stats().spot_check_mismatches.get(), 1);
    Ok(())
}

async fn start_with(db: &FakeDb, config: TabletConfig, table: Table) -> Result<TabletServer> {
    let server = TabletServer::builder(config, Arc::new(db.clone()))
        .schema_source(Arc::new(StaticSchemaSource::new(vec![table])))
        .build()?;
    server.start_service(TabletType::Master).await?;
    Ok(server)
}

/// `kv(name varchar primary key, v varchar)`, compared case-insensitively
/// by the database.
fn kv_table() -> Table {
    let mut table = Table::new("kv");
    table.add_column(TableColumn::new("name", FieldType::VarChar));
    table.add_column(TableColumn::new("v", FieldType::VarChar));
    table.set_pk(&["name"]).expect("pk column exists");
    table.cache_type = CacheType::ReadWrite;
    table
}

fn kv_rows(rows: Vec<Row>) -> QueryResult {
    rows_result(&[("name", FieldType::VarChar), ("v", FieldType::VarChar)], rows)
}

fn kv(name: &str, v: &str) -> Row {
    vec![Value::Text(name.into()), Value::Text(v.into())]
}

// FakeDb matches statements case-insensitively, so this also answers 'abc'.
const FETCH_ABC: &str = "select name, v from kv where name in ('ABC')";

#[tokio::test]
async fn test_row_with_differently_cased_key_is_returned() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_ABC, kv_rows(vec![kv("abc", "x")]));
    let server = start_with(&db, test_config(), kv_table()).await?;
    let ctx = ctx("dev");

    for _ in 0..2 {
        let result = server
            .execute(&ctx, "select * from kv where name = 'ABC'", &no_binds(), None)
            .await?;
        assert_eq!(result.rows, vec![kv("abc", "x")]);
    }
    // The spelling the database did not echo is never cached as absent.
    assert_eq!(db.count(FETCH_ABC), 2);
    let stats = server.stats();
    assert_eq!(stats.row_cache.with_label_values(&["kv", "absent"]).get(), 0);

    // The row itself was cached under the key the database returned.
    let result = server
        .execute(&ctx, "select * from kv where name = 'abc'", &no_binds(), None)
        .await?;
    assert_eq!(result.rows, vec![kv("abc", "x")]);
    assert_eq!(db.count(FETCH_ABC), 2);
    assert_eq!(stats.row_cache.with_label_values(&["kv", "hit"]).get(), 1);
    Ok(())
}

#[tokio::test]
async fn test_row_with_differently_cased_key_without_cache() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(FETCH_ABC, kv_rows(vec![kv("abc", "x")]));
    let mut config = test_config();
    config.row_cache.enabled = false;
    let server = start_with(&db, config, kv_table()).await?;

    let result = server
        .execute(&ctx("dev"), "select * from kv where name = 'ABC'", &no_binds(), None)
        .await?;
    assert_eq!(result.rows, vec![kv("abc", "x")]);
    Ok(())
}

/// `seq(id bigint auto_increment primary key, v varchar)`
fn seq_table() -> Table {
    let mut table = Table::new("seq");
    table.add_column(TableColumn::new("id", FieldType::Int64));
    table.add_column(TableColumn::new("v", FieldType::VarChar));
    table.columns[0].is_auto_increment = true;
    table.set_pk(&["id"]).expect("pk column exists");
    table.cache_type = CacheType::ReadWrite;
    table
}

#[tokio::test]
async fn test_mixed_auto_increment_insert_invalidates_generated_ids() -> Result<()> {
    const FETCH_11: &str = "select id, v from seq where id in (11)";
    const INSERT: &str = "insert into seq values (null, 'a'), (7, 'b'), (null, 'c') \
                          /* _stream seq (id ) (null ) (7 ) (null ); */";
    const SELECT_11: &str = "select * from seq where id = 11";
    let fields = [("id", FieldType::Int64), ("v", FieldType::VarChar)];

    let db = FakeDb::new();
    db.add_query(FETCH_11, rows_result(&fields, vec![]));
    db.add_query(
        INSERT,
        QueryResult {
            rows_affected: 3,
            insert_id: 10,
            ..Default::default()
        },
    );
    let mut config = test_config();
    config.enable_autocommit = true;
    let server = start_with(&db, config, seq_table()).await?;
    let ctx = ctx("dev");

    let result = server.execute(&ctx, SELECT_11, &no_binds(), None).await?;
    assert!(result.rows.is_empty());

    server
        .execute(
            &ctx,
            "insert into seq values (null, 'a'), (7, 'b'), (null, 'c')",
            &no_binds(),
            None,
        )
        .await?;
    assert_eq!(db.count(INSERT), 1);

    let c = vec![Value::Int64(11), Value::Text("c".into())];
    db.add_query(FETCH_11, rows_result(&fields, vec![c.clone()]));
    let result = server.execute(&ctx, SELECT_11, &no_binds(), None).await?;
    assert_eq!(result.rows, vec![c]);
    assert_eq!(db.count(FETCH_11), 2);
    Ok(())
}
