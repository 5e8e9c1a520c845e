//! Transaction pool.
//!
//! Each open transaction owns a connection from a dedicated pool, registered
//! under a numeric id. A transaction is used by at most one request at a
//! time: [`TxPool::lock`] fails with `TransactionInUse` instead of waiting.
//!
//! # Lifecycle
//!
//! 1. `begin`: check out a connection (bounded wait), send `begin`, register.
//! 2. Statements run through the [`TxGuard`] returned by `lock`.
//! 3. `commit` / `rollback`: unregister, send the statement, recycle the
//!    connection. Keys written inside the transaction are handed back so the
//!    caller can invalidate them.
//! 4. The killer task rolls back transactions open longer than the timeout.
//!    A transaction busy with a statement is signalled through its kill
//!    token; the statement aborts and the connection is discarded.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tablet_common::Value;
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{ConnPool, PooledConn};
use crate::stats::TabletStats;

/// Row cache keys and whole tables a transaction wrote.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DirtyKeys {
    pub keys: HashMap<String, Vec<Vec<Value>>>,
    pub tables: HashSet<String>,
}

impl DirtyKeys {
    pub fn add(&mut self, table: &str, pk_rows: impl IntoIterator<Item = Vec<Value>>) {
        self.keys.entry(table.to_string()).or_default().extend(pk_rows);
    }

    pub fn add_table(&mut self, table: &str) {
        self.tables.insert(table.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.tables.is_empty()
    }
}

/// State of one open transaction.
pub struct TxConn {
    pub conn: PooledConn,
    pub dirty: DirtyKeys,
}

struct TxSlot {
    id: i64,
    started: Instant,
    kill: CancellationToken,
    conn: Arc<AsyncMutex<TxConn>>,
}

/// Exclusive use of an open transaction.
pub struct TxGuard {
    pub id: i64,
    kill: CancellationToken,
    guard: OwnedMutexGuard<TxConn>,
}

impl TxGuard {
    /// Fires when the transaction was killed while in use.
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }
}

impl fmt::Debug for TxGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxGuard")
            .field("id", &self.id)
            .field("killed", &self.kill.is_cancelled())
            .field("dirty", &self.guard.dirty)
            .finish()
    }
}

impl Deref for TxGuard {
    type Target = TxConn;

    fn deref(&self) -> &TxConn {
        &self.guard
    }
}

impl DerefMut for TxGuard {
    fn deref_mut(&mut self) -> &mut TxConn {
        &mut self.guard
    }
}

pub struct TxPool {
    pool: ConnPool,
    active: Mutex<HashMap<i64, Arc<TxSlot>>>,
    last_id: AtomicI64,
    timeout: Duration,
    pool_timeout: Duration,
    stats: Arc<TabletStats>,
    killer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

fn not_in_transaction(id: i64) -> TabletError {
    TabletError::new(
        ErrorCode::NotInTransaction,
        format!("Transaction {}: not found", id),
    )
    .with_context(ErrorContext::Transaction { transaction_id: id })
}

impl TxPool {
    pub fn new(
        pool: ConnPool,
        timeout: Duration,
        pool_timeout: Duration,
        stats: Arc<TabletStats>,
    ) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            pool,
            active: Mutex::new(HashMap::new()),
            last_id: AtomicI64::new(seed),
            timeout,
            pool_timeout,
            stats,
            killer: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn set_gauge(&self) {
        self.stats.active_transactions.set(self.active_count() as i64);
    }

    pub async fn begin(&self) -> Result<i64> {
        let mut conn = self
            .pool
            .get(self.pool_timeout)
            .await
            .map_err(|e| e.to_tablet_error(ErrorCode::TxPoolFull))?;
        if let Err(e) = conn.execute("begin").await {
            conn.taint();
            return Err(e.into());
        }
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = Arc::new(TxSlot {
            id,
            started: Instant::now(),
            kill: CancellationToken::new(),
            conn: Arc::new(AsyncMutex::new(TxConn {
                conn,
                dirty: DirtyKeys::default(),
            })),
        });
        self.active.lock().insert(id, slot);
        self.stats.transaction_event("begin");
        self.set_gauge();
        debug!(target: "tx", transaction_id = id, "begin");
        Ok(id)
    }

    fn slot(&self, id: i64) -> Result<Arc<TxSlot>> {
        self.active
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_in_transaction(id))
    }

    /// Take exclusive use of an open transaction.
    pub fn lock(&self, id: i64) -> Result<TxGuard> {
        let slot = self.slot(id)?;
        let guard = slot.conn.clone().try_lock_owned().map_err(|_| {
            TabletError::new(
                ErrorCode::TransactionInUse,
                format!("Transaction {}: in use", id),
            )
            .with_context(ErrorContext::Transaction { transaction_id: id })
        })?;
        Ok(TxGuard {
            id,
            kill: slot.kill.clone(),
            guard,
        })
    }

    fn unregister(&self, id: i64) -> Option<Arc<TxSlot>> {
        let slot = self.active.lock().remove(&id);
        self.set_gauge();
        slot
    }

    /// Commit, moving what the transaction wrote into `dirty`. The writes are
    /// handed over before the commit is sent, so they reach the caller even
    /// when the outcome of a failed commit is unknown.
    pub async fn commit(&self, id: i64, dirty: &mut DirtyKeys) -> Result<()> {
        let mut guard = self.lock(id)?;
        self.unregister(id);
        *dirty = std::mem::take(&mut guard.dirty);
        match guard.conn.execute("commit").await {
            Ok(_) => {
                self.stats.transaction_event("commit");
                debug!(target: "tx", transaction_id = id, "commit");
                Ok(())
            }
            Err(e) => {
                guard.conn.taint();
                self.stats.transaction_event("rollback");
                warn!(target: "tx", transaction_id = id, error = %e, "commit failed");
                Err(e.into())
            }
        }
    }

    pub async fn rollback(&self, id: i64) -> Result<()> {
        let mut guard = self.lock(id)?;
        self.unregister(id);
        Self::rollback_guard(&mut guard).await;
        self.stats.transaction_event("rollback");
        Ok(())
    }

    async fn rollback_guard(guard: &mut TxGuard) {
        if let Err(e) = guard.conn.execute("rollback").await {
            warn!(target: "tx", transaction_id = guard.id, error = %e, "rollback failed");
            guard.conn.taint();
        } else {
            debug!(target: "tx", transaction_id = guard.id, "rollback");
        }
    }

    /// Release a transaction whose connection can no longer be trusted.
    /// The connection is closed and the database rolls the work back.
    pub fn discard(&self, guard: &mut TxGuard) {
        guard.conn.taint();
        if self.unregister(guard.id).is_some() {
            self.stats.transaction_event("rollback");
        }
        warn!(target: "tx", transaction_id = guard.id, "transaction discarded");
    }

    /// Roll back transactions open longer than the timeout. Returns how many
    /// were killed.
    pub async fn kill_expired(&self) -> usize {
        let expired: Vec<Arc<TxSlot>> = {
            let mut active = self.active.lock();
            let ids: Vec<i64> = active
                .values()
                .filter(|s| s.started.elapsed() > self.timeout)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| active.remove(id)).collect()
        };
        self.set_gauge();
        for slot in &expired {
            warn!(
                target: "tx",
                transaction_id = slot.id,
                age_ms = slot.started.elapsed().as_millis() as u64,
                "killing transaction"
            );
            slot.kill.cancel();
            self.stats.transaction_event("killed");
            // In use: the running statement observes the kill token.
            if let Ok(guard) = slot.conn.clone().try_lock_owned() {
                let mut guard = TxGuard {
                    id: slot.id,
                    kill: slot.kill.clone(),
                    guard,
                };
                Self::rollback_guard(&mut guard).await;
            }
        }
        expired.len()
    }

    /// Start the background killer, checking every tenth of the timeout.
    pub fn start_killer(self: &Arc<Self>) {
        let interval = (self.timeout / 10).max(Duration::from_millis(10));
        let token = CancellationToken::new();
        let child = token.clone();
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.kill_expired().await;
                    }
                }
            }
        });
        if let Some((old, _)) = self.killer.lock().replace((token, handle)) {
            old.cancel();
        }
    }

    pub fn stop_killer(&self) {
        if let Some((token, _)) = self.killer.lock().take() {
            token.cancel();
        }
    }

    /// Roll back every open transaction, waiting for in-use ones.
    pub async fn rollback_all(&self) {
        let slots: Vec<Arc<TxSlot>> = self.active.lock().drain().map(|(_, s)| s).collect();
        self.set_gauge();
        if !slots.is_empty() {
            info!(target: "tx", count = slots.len(), "rolling back open transactions");
        }
        futures::future::join_all(slots.into_iter().map(|slot| async move {
            slot.kill.cancel();
            let guard = slot.conn.clone().lock_owned().await;
            let mut guard = TxGuard {
                id: slot.id,
                kill: slot.kill.clone(),
                guard,
            };
            Self::rollback_guard(&mut guard).await;
            self.stats.transaction_event("rollback");
        }))
        .await;
    }
}
