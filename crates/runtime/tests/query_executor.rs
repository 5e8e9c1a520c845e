mod common;

use std::time::Duration;

use anyhow::Result;
use common::{add_dual, ctx, pk_rows, row, start_server, test_config, test_rows};
use tablet_common::{BindVariables, QueryResult, Value};
use tablet_error::ErrorCode;
use tablet_runtime::testing::FakeDb;
use tablet_runtime::{Controller, QueryService, SqlError, TabletType};

fn no_binds() -> BindVariables {
    BindVariables::new()
}

#[tokio::test]
async fn test_dml_pk_in_transaction_is_annotated() -> Result<()> {
    let db = FakeDb::new();
    let annotated = "update test_table set name = 2 where pk in (1) /* _stream test_table (pk ) (1 ); */";
    db.add_query(annotated, QueryResult::affected(1));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let result = server
        .execute(&ctx, "update test_table set name = 2 where pk in (1)", &no_binds(), Some(id))
        .await?;
    server.commit(&ctx, id).await?;

    assert_eq!(result.rows_affected, 1);
    assert_eq!(db.count(annotated), 1);
    let log = db.query_log();
    assert_eq!(log.first().map(String::as_str), Some("begin"));
    assert_eq!(log.last().map(String::as_str), Some("commit"));
    Ok(())
}

#[tokio::test]
async fn test_insert_pk_is_annotated() -> Result<()> {
    let db = FakeDb::new();
    let annotated = "insert into test_table values (1) /* _stream test_table (pk ) (1 ); */";
    db.add_query(annotated, QueryResult::affected(1));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    server
        .execute(&ctx, "insert into test_table values(1)", &no_binds(), Some(id))
        .await?;
    server.commit(&ctx, id).await?;
    assert_eq!(db.count(annotated), 1);
    Ok(())
}

#[tokio::test]
async fn test_dml_outside_transaction() -> Result<()> {
    let db = FakeDb::new();
    let annotated = "delete from test_table where pk in (1) /* _stream test_table (pk ) (1 ); */";
    db.add_query(annotated, QueryResult::affected(1));

    let server = start_server(&db, test_config()).await?;
    let err = server
        .execute(&ctx("dev"), "delete from test_table where pk = 1", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DisallowedOutsideTransaction);
    assert_eq!(db.count(annotated), 0);

    let mut config = test_config();
    config.enable_autocommit = true;
    let server = start_server(&db, config).await?;
    db.clear_log();
    let result = server
        .execute(&ctx("dev"), "delete from test_table where pk = 1", &no_binds(), None)
        .await?;
    assert_eq!(result.rows_affected, 1);
    assert_eq!(db.query_log(), vec!["begin", annotated, "commit"]);
    Ok(())
}

#[tokio::test]
async fn test_pk_in_returns_rows_in_key_order() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select pk, name, addr from test_table where pk in (2, 1)",
        test_rows(vec![row(1, "a", "x"), row(2, "b", "y")]),
    );
    let server = start_server(&db, test_config()).await?;

    let result = server
        .execute(
            &ctx("dev"),
            "select name, pk from test_table where pk in (2, 1, 2)",
            &no_binds(),
            None,
        )
        .await?;
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("b".into()), Value::Int64(2)],
            vec![Value::Text("a".into()), Value::Int64(1)],
        ]
    );
    assert_eq!(result.rows_affected, 2);
    let names: Vec<_> = result.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["name", "pk"]);
    Ok(())
}

#[tokio::test]
async fn test_pk_in_with_bind_variable_and_zero_limit() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select pk, name, addr from test_table where pk in (7)",
        test_rows(vec![row(7, "g", "z")]),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let mut binds = BindVariables::new();
    binds.insert("id".into(), Value::Text("7".into()));
    let result = server
        .execute(&ctx, "select * from test_table where pk = :id", &binds, None)
        .await?;
    assert_eq!(result.rows, vec![row(7, "g", "z")]);

    db.clear_log();
    let result = server
        .execute(&ctx, "select * from test_table where pk in (7) limit 0", &no_binds(), None)
        .await?;
    assert!(result.rows.is_empty());
    assert!(db.query_log().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_bind_variable() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let err = server
        .execute(&ctx("dev"), "select * from test_table where pk = :id", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingBindVariable);
    Ok(())
}

#[tokio::test]
async fn test_select_subquery_fetches_by_key() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select pk from test_table where name = 1 limit 10001",
        pk_rows(&[3, 1]),
    );
    db.add_query(
        "select pk, name, addr from test_table where pk in (3, 1)",
        test_rows(vec![row(1, "1", "a"), row(3, "1", "c")]),
    );
    let server = start_server(&db, test_config()).await?;

    let result = server
        .execute(&ctx("dev"), "select * from test_table where name = 1", &no_binds(), None)
        .await?;
    assert_eq!(result.rows, vec![row(3, "1", "c"), row(1, "1", "a")]);
    Ok(())
}

#[tokio::test]
async fn test_pass_select_row_limit() -> Result<()> {
    let db = FakeDb::new();
    let mut config = test_config();
    config.max_result_size = 2;
    db.add_query(
        "select name from test_table group by name limit 3",
        test_rows(vec![row(1, "a", ""), row(2, "b", ""), row(3, "c", "")]),
    );
    let server = start_server(&db, config).await?;

    let err = server
        .execute(
            &ctx("dev"),
            "select name from test_table group by name",
            &no_binds(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RowCountExceeded);
    assert_eq!(err.message, "Row count exceeded 2");
    Ok(())
}

#[tokio::test]
async fn test_locking_read_requires_transaction() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select * from test_table limit 10001 for update",
        test_rows(vec![row(1, "a", "b")]),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let err = server
        .execute(&ctx, "select * from test_table for update", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DisallowedOutsideTransaction);

    let id = server.begin(&ctx).await?;
    let result = server
        .execute(&ctx, "select * from test_table for update", &no_binds(), Some(id))
        .await?;
    assert_eq!(result.rows.len(), 1);
    server.rollback(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_dml_subquery_stops_at_row_limit() -> Result<()> {
    let db = FakeDb::new();
    let mut config = test_config();
    config.max_dml_rows = 2;
    db.add_query(
        "select pk from test_table where name = 1 limit 3 for update",
        pk_rows(&[1, 2, 3]),
    );
    let annotated = "delete from test_table where pk in (1, 2) /* _stream test_table (pk ) (1 ) (2 ); */";
    db.add_query(annotated, QueryResult::affected(2));
    let server = start_server(&db, config).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let result = server
        .execute(&ctx, "delete from test_table where name = 1", &no_binds(), Some(id))
        .await?;
    server.commit(&ctx, id).await?;

    assert!(result.partial);
    assert_eq!(result.rows_affected, 2);
    assert_eq!(db.count(annotated), 1);
    assert_eq!(server.stats().partial_dml.get(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dml_subquery_with_no_matches() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select pk from test_table where name = 9 limit 501 for update",
        pk_rows(&[]),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let result = server
        .execute(&ctx, "update test_table set addr = 1 where name = 9", &no_binds(), Some(id))
        .await?;
    server.commit(&ctx, id).await?;
    assert_eq!(result.rows_affected, 0);
    assert!(!result.partial);
    Ok(())
}

#[tokio::test]
async fn test_upsert_counts_affected_rows() -> Result<()> {
    let db = FakeDb::new();
    let insert = "insert into test_table values (1) /* _stream test_table (pk ) (1 ); */";
    let update = "update test_table set name = 2 where pk in (1) /* _stream test_table (pk ) (1 ); */";
    let sql = "insert into test_table values (1) on duplicate key update name = 2";
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    db.add_query(insert, QueryResult::affected(1));
    let id = server.begin(&ctx).await?;
    let result = server.execute(&ctx, sql, &no_binds(), Some(id)).await?;
    assert_eq!(result.rows_affected, 1);

    db.add_rejected_query(
        insert,
        SqlError::new(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'"),
    );
    db.add_query(update, QueryResult::affected(1));
    let result = server.execute(&ctx, sql, &no_binds(), Some(id)).await?;
    assert_eq!(result.rows_affected, 2);

    db.add_query(update, QueryResult::affected(0));
    let result = server.execute(&ctx, sql, &no_binds(), Some(id)).await?;
    assert_eq!(result.rows_affected, 1);

    server.commit(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_upsert_secondary_key_conflict_is_returned() -> Result<()> {
    let db = FakeDb::new();
    let insert = "insert into test_table values (1) /* _stream test_table (pk ) (1 ); */";
    db.add_rejected_query(
        insert,
        SqlError::new(1062, "23000", "Duplicate entry 'a' for key 'name_idx'"),
    );
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let err = server
        .execute(
            &ctx,
            "insert into test_table values (1) on duplicate key update name = 2",
            &no_binds(),
            Some(id),
        )
        .await
        .unwrap_err();
    assert_eq!(err.sql_errno(), Some(1062));
    server.rollback(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_strict_mode_rejects_pass_dml() -> Result<()> {
    let db = FakeDb::new();
    db.add_query("update test_table set pk = foo()", QueryResult::affected(3));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let err = server
        .execute(&ctx, "update test_table set pk = foo()", &no_binds(), Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DmlTooComplex);

    server
        .execute(&ctx, "set vt_strict_mode = 0", &no_binds(), None)
        .await?;
    let result = server
        .execute(&ctx, "update test_table set pk = foo()", &no_binds(), Some(id))
        .await?;
    assert_eq!(result.rows_affected, 3);
    server.commit(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_set_tunables() -> Result<()> {
    let db = FakeDb::new();
    db.add_query("set names utf8", QueryResult::default());
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    server
        .execute(&ctx, "set vt_max_result_size = 5", &no_binds(), None)
        .await?;
    let engine = server.engine().expect("serving");
    assert_eq!(engine.tunables.max_result_size(), 5);
    assert!(db.query_log().is_empty());

    let err = server
        .execute(&ctx, "set vt_max_dml_rows = 0", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidConfig);

    server.execute(&ctx, "set names utf8", &no_binds(), None).await?;
    assert_eq!(db.count("set names utf8"), 1);
    Ok(())
}

#[tokio::test]
async fn test_query_timeout_discards_connection() -> Result<()> {
    let db = FakeDb::new();
    let slow = "select pk, name, addr from test_table where pk in (1)";
    db.add_query(slow, test_rows(vec![row(1, "a", "b")]));
    db.add_delay(slow, Duration::from_millis(500));
    add_dual(&db);
    let server = start_server(&db, test_config()).await?;

    let ctx = ctx("dev").with_timeout(Duration::from_millis(50));
    let err = server
        .execute(&ctx, "select * from test_table where pk = 1", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QueryTimeout);

    let before = db.connection_count();
    server
        .execute(&common::ctx("dev"), "select 1 from dual", &no_binds(), None)
        .await?;
    assert_eq!(db.connection_count(), before + 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_releases_transaction() -> Result<()> {
    let db = FakeDb::new();
    let annotated = "delete from test_table where pk in (1) /* _stream test_table (pk ) (1 ); */";
    db.add_query(annotated, QueryResult::affected(1));
    db.add_delay(annotated, Duration::from_secs(5));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });
    let err = server
        .execute(&ctx, "delete from test_table where pk = 1", &no_binds(), Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QueryCancelled);

    let err = server
        .commit(&common::ctx("dev"), id)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInTransaction);
    assert_eq!(db.count("commit"), 0);
    Ok(())
}

#[tokio::test]
async fn test_ddl_runs_in_own_transaction() -> Result<()> {
    let db = FakeDb::new();
    db.add_query("alter table test_table add zipcode int", QueryResult::default());
    let server = start_server(&db, test_config()).await?;

    server
        .execute(
            &ctx("dev"),
            "alter table test_table add zipcode int",
            &no_binds(),
            None,
        )
        .await?;
    assert_eq!(
        db.query_log(),
        vec!["begin", "alter table test_table add zipcode int", "commit"]
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_ddl_rolls_back() -> Result<()> {
    let db = FakeDb::new();
    db.add_rejected_query(
        "drop table test_table",
        SqlError::new(1051, "42S02", "Unknown table 'test_table'"),
    );
    let server = start_server(&db, test_config()).await?;

    let err = server
        .execute(&ctx("dev"), "drop table test_table", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.sql_errno(), Some(1051));
    assert_eq!(db.query_log(), vec!["begin", "drop table test_table", "rollback"]);
    Ok(())
}

#[tokio::test]
async fn test_stream_execute_chunks_rows() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(
        "select * from test_table limit 18446744073709551615",
        test_rows(vec![row(1, "a", "x"), row(2, "b", "y"), row(3, "c", "z")]),
    );
    let mut config = test_config();
    config.stream_buffer_size = 1;
    let server = start_server(&db, config).await?;

    let mut replies = Vec::new();
    server
        .stream_execute(&ctx("dev"), "select * from test_table", &no_binds(), &mut |reply| {
            replies.push(reply);
            Ok(())
        })
        .await?;

    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0].fields.len(), 3);
    assert!(replies[0].rows.is_empty());
    assert!(replies[1..].iter().all(|r| r.rows.len() == 1 && r.fields.is_empty()));
    Ok(())
}

#[tokio::test]
async fn test_stream_rejects_dml() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let err = server
        .stream_execute(&ctx("dev"), "delete from test_table where pk = 1", &no_binds(), &mut |_| Ok(()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedQuery);
    Ok(())
}

#[tokio::test]
async fn test_serving_state_and_tablet_type() -> Result<()> {
    let db = FakeDb::new();
    add_dual(&db);
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");
    server.is_healthy().await?;

    server.set_serving_type(TabletType::Replica, true).await?;
    let err = server.begin(&ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NonMasterTransaction);
    server.execute(&ctx, "select 1 from dual", &no_binds(), None).await?;

    server.stop_service().await;
    let err = server
        .execute(&ctx, "select 1 from dual", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotServing);
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_syntax_error() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let err = server
        .execute(&ctx("dev"), "selec * from test_table", &no_binds(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SyntaxError);
    Ok(())
}

#[tokio::test]
async fn test_terse_errors_hide_bind_values() -> Result<()> {
    let db = FakeDb::new();
    let annotated = "delete from test_table where pk in (1) /* _stream test_table (pk ) (1 ); */";
    db.add_rejected_query(
        annotated,
        SqlError::new(1213, "40001", "Deadlock found when trying to get lock; secret 1"),
    );
    let mut config = test_config();
    config.terse_errors = true;
    let server = start_server(&db, config).await?;
    let ctx = ctx("dev");

    let mut binds = BindVariables::new();
    binds.insert("id".into(), Value::Int64(1));
    let id = server.begin(&ctx).await?;
    let err = server
        .execute(&ctx, "delete from test_table where pk = :id", &binds, Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LockConflict);
    assert!(!err.message.contains("secret"));
    assert!(err.message.contains("delete from test_table where pk = :id"));
    server.rollback(&ctx, id).await?;
    Ok(())
}
