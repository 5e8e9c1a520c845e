mod common;

use std::time::Duration;

use anyhow::Result;
use common::{ctx, row, start_server, test_config, test_rows};
use tablet_common::{BindVariables, QueryResult};
use tablet_error::ErrorCode;
use tablet_runtime::testing::FakeDb;
use tablet_runtime::{Controller, QueryService, ServingState, SqlError};

const DELETE_1: &str = "delete from test_table where pk in (1) /* _stream test_table (pk ) (1 ); */";

#[tokio::test]
async fn test_expired_transaction_is_killed() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(DELETE_1, QueryResult::affected(1));
    let mut config = test_config();
    config.transaction_timeout_secs = 0.1;
    let server = start_server(&db, config).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let err = server
        .execute(&ctx, "delete from test_table where pk = 1", &BindVariables::new(), Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInTransaction);
    assert_eq!(db.count("rollback"), 1);
    assert_eq!(
        server
            .stats()
            .transactions
            .with_label_values(&["killed"])
            .get(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_transaction_cap() -> Result<()> {
    let db = FakeDb::new();
    let mut config = test_config();
    config.transaction_cap = 1;
    config.tx_pool_timeout_secs = 0.05;
    let server = start_server(&db, config).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let err = server.begin(&ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TxPoolFull);
    assert!(err.is_retryable());

    server.commit(&ctx, id).await?;
    let id = server.begin(&ctx).await?;
    server.rollback(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_use_of_transaction() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(DELETE_1, QueryResult::affected(1));
    db.add_delay(DELETE_1, Duration::from_millis(300));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let background = {
        let server = server.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            server
                .execute(&ctx, "delete from test_table where pk = 1", &BindVariables::new(), Some(id))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = server
        .execute(&ctx, "delete from test_table where pk = 1", &BindVariables::new(), Some(id))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::TransactionInUse);

    background.await??;
    server.commit(&ctx, id).await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_transaction() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let err = server.commit(&ctx("dev"), 12345).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInTransaction);
    Ok(())
}

#[tokio::test]
async fn test_stop_service_rolls_back_open_transactions() -> Result<()> {
    let db = FakeDb::new();
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    server.begin(&ctx).await?;
    server.begin(&ctx).await?;
    server.stop_service().await;

    assert_eq!(server.serving_state(), ServingState::NotServing);
    assert_eq!(db.count("rollback"), 2);
    assert_eq!(server.stats().active_transactions.get(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stop_service_waits_for_running_statement() -> Result<()> {
    let db = FakeDb::new();
    db.add_query(DELETE_1, QueryResult::affected(1));
    db.add_delay(DELETE_1, Duration::from_millis(200));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");

    let id = server.begin(&ctx).await?;
    let running = {
        let server = server.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            server
                .execute(&ctx, "delete from test_table where pk = 1", &BindVariables::new(), Some(id))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop_service().await;

    let result = running.await??;
    assert_eq!(result.rows_affected, 1);
    assert_eq!(db.count(DELETE_1), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_still_invalidates_written_rows() -> Result<()> {
    const FETCH_1: &str = "select pk, name, addr from test_table where pk in (1)";
    const SELECT_1: &str = "select * from test_table where pk = 1";
    let db = FakeDb::new();
    db.add_query(FETCH_1, test_rows(vec![row(1, "a", "b")]));
    db.add_query(DELETE_1, QueryResult::affected(1));
    let server = start_server(&db, test_config()).await?;
    let ctx = ctx("dev");
    let binds = BindVariables::new();

    server.execute(&ctx, SELECT_1, &binds, None).await?;
    let id = server.begin(&ctx).await?;
    server
        .execute(&ctx, "delete from test_table where pk = 1", &binds, Some(id))
        .await?;

    // The connection drops mid-commit: the delete may or may not have landed.
    db.add_rejected_query("commit", SqlError::new(2013, "HY000", "Lost connection to MySQL server"));
    server.commit(&ctx, id).await.unwrap_err();

    db.add_query(FETCH_1, test_rows(vec![]));
    let result = server.execute(&ctx, SELECT_1, &binds, None).await?;
    assert!(result.rows.is_empty());
    assert_eq!(db.count(FETCH_1), 2);
    Ok(())
}
