mod common;

use anyhow::Result;
use common::{ctx, row, start_server, test_config, test_rows};
use tablet_common::{BoundQuery, QueryResult};
use tablet_error::ErrorCode;
use tablet_runtime::testing::FakeDb;
use tablet_runtime::{QueryService, SqlError};

const INSERT_1: &str = "insert into test_table values (1) /* _stream test_table (pk ) (1 ); */";
const INSERT_2: &str = "insert into test_table values (2) /* _stream test_table (pk ) (2 ); */";

#[tokio::test]
async fn test_empty_batch() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let err = server
        .execute_batch(&ctx("dev"), &[], false, None)
        .await
        .unwrap_err();
    assert_eq!(err.error.code, ErrorCode::EmptyBatch);
    assert_eq!(err.error.message, "Empty query list");
    Ok(())
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let queries = [BoundQuery::new("insert into test_table values (1)")];
    let err = server
        .execute_batch(&ctx, &queries, true, Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.error.code, ErrorCode::NestedTransaction);
    assert_eq!(
        err.error.message,
        "cannot start a new transaction in the scope of an existing one"
    );
    assert_eq!(db.count(INSERT_1), 0);
    server.rollback(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_as_transaction_commits() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(INSERT_1, QueryResult::affected(1));
    db.add_query(INSERT_2, QueryResult::affected(1));
    let server = start_server(&db, test_config()).await?;

    let queries = [
        BoundQuery::new("insert into test_table values (1)"),
        BoundQuery::new("insert into test_table values (:id)").bind("id", 2i64),
    ];
    let results = server
        .execute_batch(&ctx("dev"), &queries, true, None)
        .await?;
    assert_eq!(results.len(), 2);
    assert_eq!(db.query_log(), vec!["begin", INSERT_1, INSERT_2, "commit"]);
    Ok(())
}

#[tokio::test]
async fn test_batch_failure_rolls_back_and_reports_progress() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(INSERT_1, QueryResult::affected(1));
    db.add_rejected_query(
        INSERT_2,
        SqlError::new(1062, "23000", "Duplicate entry '2' for key 'PRIMARY'"),
    );
    let server = start_server(&db, test_config()).await?;

    let queries = [
        BoundQuery::new("insert into test_table values (1)"),
        BoundQuery::new("insert into test_table values (2)"),
        BoundQuery::new("insert into test_table values (3)"),
    ];
    let err = server
        .execute_batch(&ctx("dev"), &queries, true, None)
        .await
        .unwrap_err();
    assert_eq!(err.completed.len(), 1);
    assert_eq!(err.error.sql_errno(), Some(1062));
    assert_eq!(db.query_log(), vec!["begin", INSERT_1, INSERT_2, "rollback"]);
    Ok(())
}

#[tokio::test]
async fn test_batch_in_caller_transaction() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(INSERT_1, QueryResult::affected(1));
    db.add_query(INSERT_2, QueryResult::affected(1));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let queries = [
        BoundQuery::new("insert into test_table values (1)"),
        BoundQuery::new("insert into test_table values (2)"),
    ];
    server.execute_batch(&ctx, &queries, false, Some(id)).await?;
    assert_eq!(db.count("commit"), 0);
    server.commit(&ctx, id).await?;
    assert_eq!(db.count("commit"), 1);
    Ok(())
}

#[tokio::test]
async fn test_batch_with_autocommit_outside_transaction() -> Result<()> {
    const INSERT_4: &str = "insert into test_table values (4) /* _stream test_table (pk ) (4 ); */";
    const FETCH_4: &str = "select pk, name, addr from test_table where pk in (4)";
    const DELETE_4: &str = "delete from test_table where pk in (4) /* _stream test_table (pk ) (4 ); */";

    let db = FakeDb::new();
    db.add_query(INSERT_4, QueryResult::affected(1));
    db.add_query(FETCH_4, test_rows(vec![row(4, "", "")]));
    db.add_query(DELETE_4, QueryResult::affected(1));
    let mut config = test_config();
    config.enable_autocommit = true;
    let server = start_server(&db, config).await?;

    let queries = [
        BoundQuery::new("insert into test_table values (4)"),
        BoundQuery::new("select * from test_table where pk = 4"),
        BoundQuery::new("delete from test_table where pk = 4"),
    ];
    let results = server
        .execute_batch(&ctx("dev"), &queries, false, None)
        .await?;
    assert_eq!(results[1].rows, vec![row(4, "", "")]);
    assert_eq!(
        db.query_log(),
        vec!["begin", INSERT_4, "commit", FETCH_4, "begin", DELETE_4, "commit"]
    );
    Ok(())
}
