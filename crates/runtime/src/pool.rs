//! Bounded connection pools.
//!
//! A pool caps the number of open sessions with a `tokio::sync::Semaphore`.
//! Every checked-out [`PooledConn`] holds one permit; dropping it returns the
//! session to the idle list unless it was tainted, in which case the session
//! is closed and the slot becomes free for a fresh connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tablet_common::QueryResult;
use tablet_error::{ErrorCode, ErrorContext, TabletError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::db::{ConnectionFactory, DbConnection, SqlError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{pool}: timed out waiting for a connection after {timeout:?}")]
    Timeout {
        pool: &'static str,
        capacity: usize,
        timeout: Duration,
    },
    #[error("{pool}: pool is closed")]
    Closed { pool: &'static str },
    #[error("{pool}: cannot connect: {source}")]
    Connect {
        pool: &'static str,
        #[source]
        source: SqlError,
    },
}

impl PoolError {
    /// Map to the engine error. `full_code` lets the transaction pool report
    /// exhaustion as `TxPoolFull`.
    pub fn to_tablet_error(&self, full_code: ErrorCode) -> TabletError {
        match self {
            PoolError::Timeout {
                pool,
                capacity,
                timeout,
            } => TabletError::new(full_code, self.to_string()).with_context(ErrorContext::Pool {
                pool: pool.to_string(),
                capacity: *capacity,
                timeout_ms: timeout.as_millis() as u64,
            }),
            PoolError::Closed { .. } => TabletError::new(ErrorCode::PoolClosed, self.to_string()),
            PoolError::Connect { source, .. } => {
                TabletError::from_sql(source.number, &source.state, self.to_string())
            }
        }
    }
}

impl From<PoolError> for TabletError {
    fn from(err: PoolError) -> Self {
        err.to_tablet_error(ErrorCode::PoolTimeout)
    }
}

struct IdleConn {
    conn: Box<dyn DbConnection>,
    since: Instant,
}

struct PoolInner {
    name: &'static str,
    capacity: usize,
    idle_timeout: Duration,
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
    closed: AtomicBool,
}

/// A named, bounded pool of database sessions.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub fn new(
        name: &'static str,
        capacity: usize,
        idle_timeout: Duration,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                idle_timeout,
                factory,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Connections that can still be checked out without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a connection, waiting at most `timeout` for a free slot.
    pub async fn get(&self, timeout: Duration) -> Result<PooledConn, PoolError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(PoolError::Closed { pool: inner.name });
        }

        let permit = match tokio::time::timeout(timeout, inner.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed { pool: inner.name }),
            Err(_) => {
                return Err(PoolError::Timeout {
                    pool: inner.name,
                    capacity: inner.capacity,
                    timeout,
                })
            }
        };

        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConn::new(self.clone(), conn, permit));
        }

        // The permit is released on the error path when it drops here.
        let conn = inner
            .factory
            .connect()
            .await
            .map_err(|source| PoolError::Connect {
                pool: inner.name,
                source,
            })?;
        debug!(pool = inner.name, "opened connection");
        Ok(PooledConn::new(self.clone(), conn, permit))
    }

    fn pop_idle(&self) -> Option<Box<dyn DbConnection>> {
        let mut idle = self.inner.idle.lock();
        while let Some(entry) = idle.pop_front() {
            let expired =
                !self.inner.idle_timeout.is_zero() && entry.since.elapsed() > self.inner.idle_timeout;
            if expired || !entry.conn.is_open() {
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn put_back(&self, conn: Box<dyn DbConnection>) {
        if self.is_closed() || !conn.is_open() {
            return;
        }
        self.inner.idle.lock().push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
    }

    /// Refuse new checkouts and drop idle sessions. Checked-out connections are
    /// closed as they come back.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        self.inner.idle.lock().clear();
        debug!(pool = self.inner.name, "pool closed");
    }
}

/// A checked-out session. Returned to its pool on drop.
pub struct PooledConn {
    pool: ConnPool,
    conn: Option<Box<dyn DbConnection>>,
    _permit: OwnedSemaphorePermit,
    tainted: bool,
}

impl PooledConn {
    fn new(pool: ConnPool, conn: Box<dyn DbConnection>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            _permit: permit,
            tainted: false,
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult, SqlError> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(sql).await,
            None => Err(SqlError::new(2006, "HY000", "connection already released")),
        }
    }

    /// Mark the session unusable: it is closed instead of being reused.
    pub fn taint(&mut self) {
        if !self.tainted {
            warn!(pool = self.pool.name(), "discarding connection");
        }
        self.tainted = true;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn pool_name(&self) -> &'static str {
        self.pool.name()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.tainted {
                self.pool.put_back(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDb;

    fn pool(capacity: usize, db: &FakeDb) -> ConnPool {
        ConnPool::new("test", capacity, Duration::from_secs(60), Arc::new(db.clone()))
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let db = FakeDb::new();
        let pool = pool(2, &db);
        {
            let mut conn = pool.get(Duration::from_secs(1)).await.unwrap();
            conn.execute("select 1 from dual").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        let _conn = pool.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(db.connection_count(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_timeout_when_exhausted() {
        let db = FakeDb::new();
        let pool = pool(1, &db);
        let _held = pool.get(Duration::from_secs(1)).await.unwrap();
        let err = pool.get(Duration::from_millis(20)).await.err().unwrap();
        assert!(matches!(err, PoolError::Timeout { capacity: 1, .. }));

        let tablet = err.to_tablet_error(ErrorCode::TxPoolFull);
        assert_eq!(tablet.code, ErrorCode::TxPoolFull);
        assert!(tablet.is_retryable());
    }

    #[tokio::test]
    async fn test_tainted_connection_is_closed() {
        let db = FakeDb::new();
        let pool = pool(1, &db);
        {
            let mut conn = pool.get(Duration::from_secs(1)).await.unwrap();
            conn.taint();
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);
        let _conn = pool.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(db.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let db = FakeDb::new();
        db.set_connect_error(Some(SqlError::new(2003, "HY000", "can't connect")));
        let pool = pool(1, &db);
        assert!(matches!(
            pool.get(Duration::from_secs(1)).await,
            Err(PoolError::Connect { .. })
        ));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let db = FakeDb::new();
        let pool = pool(1, &db);
        pool.close();
        assert!(matches!(
            pool.get(Duration::from_secs(1)).await,
            Err(PoolError::Closed { .. })
        ));
    }
}
