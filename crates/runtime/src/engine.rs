//! The query engine: everything a serving tablet needs to execute statements.
//!
//! A `QueryEngine` owns:
//!
//! 1. **Schema**: the schema cache and the plan cache built on top of it.
//! 2. **Pools**: the non-transactional pool, the streaming pool and the
//!    transaction pool.
//! 3. **Row cache**: optional, shared by every read plan that resolves rows by
//!    primary key.
//! 4. **Tunables**: limits that `set vt_*` statements may change at runtime.
//!
//! The server creates a fresh engine each time it starts serving and closes it
//! on stop. Rule sources, the table ACL and stats outlive engines and are
//! shared with them.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tablet_common::config::TabletConfig;
use tablet_common::Value;
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tracing::{debug, info, warn};

use crate::db::ConnectionFactory;
use crate::dialect::ConflictKeyParser;
use crate::policy::Policy;
use crate::pool::ConnPool;
use crate::rowcache::{CacheService, MemoryCacheService, RowCache};
use crate::schema::{DbSchemaSource, SchemaInfo, SchemaSource};
use crate::stats::TabletStats;
use crate::tx_pool::{DirtyKeys, TxPool};

pub const HEALTH_CHECK_QUERY: &str = "select 1 from dual";

/// Limits read on every statement. Changed by `set` statements on the
/// `vt_*` keys.
#[derive(Debug)]
pub struct Tunables {
    max_result_size: AtomicUsize,
    max_dml_rows: AtomicUsize,
    stream_buffer_size: AtomicUsize,
    query_timeout_ms: AtomicU64,
    strict_mode: AtomicBool,
    spot_check_ratio: AtomicU64,
}

impl Tunables {
    pub fn from_config(config: &TabletConfig) -> Self {
        Self {
            max_result_size: AtomicUsize::new(config.max_result_size),
            max_dml_rows: AtomicUsize::new(config.max_dml_rows),
            stream_buffer_size: AtomicUsize::new(config.stream_buffer_size),
            query_timeout_ms: AtomicU64::new(
                config.query_timeout().map_or(0, |t| t.as_millis() as u64),
            ),
            strict_mode: AtomicBool::new(config.strict_mode),
            spot_check_ratio: AtomicU64::new(config.row_cache.spot_check_ratio.to_bits()),
        }
    }

    pub fn max_result_size(&self) -> usize {
        self.max_result_size.load(Ordering::Relaxed)
    }

    pub fn max_dml_rows(&self) -> usize {
        self.max_dml_rows.load(Ordering::Relaxed)
    }

    pub fn stream_buffer_size(&self) -> usize {
        self.stream_buffer_size.load(Ordering::Relaxed)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        match self.query_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode.load(Ordering::Relaxed)
    }

    pub fn spot_check_ratio(&self) -> f64 {
        f64::from_bits(self.spot_check_ratio.load(Ordering::Relaxed))
    }

    /// Apply `set key = value`. Returns false for keys the engine does not
    /// own, which are forwarded to the database.
    pub fn apply(&self, key: &str, value: &Value) -> Result<bool> {
        match key.to_ascii_lowercase().as_str() {
            "vt_max_result_size" => {
                let n = positive(key, value)?;
                self.max_result_size.store(n as usize, Ordering::Relaxed);
            }
            "vt_max_dml_rows" => {
                let n = positive(key, value)?;
                self.max_dml_rows.store(n as usize, Ordering::Relaxed);
            }
            "vt_stream_buffer_size" => {
                let n = positive(key, value)?;
                self.stream_buffer_size.store(n as usize, Ordering::Relaxed);
            }
            "vt_query_timeout" => {
                let secs = number(key, value)?;
                if secs < 0.0 {
                    return Err(invalid_value(key, value));
                }
                let ms = (secs * 1000.0) as u64;
                self.query_timeout_ms.store(ms, Ordering::Relaxed);
            }
            "vt_strict_mode" => {
                let on = number(key, value)? != 0.0;
                self.strict_mode.store(on, Ordering::Relaxed);
            }
            "vt_spot_check_ratio" => {
                let ratio = number(key, value)?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(invalid_value(key, value));
                }
                self.spot_check_ratio.store(ratio.to_bits(), Ordering::Relaxed);
            }
            _ => return Ok(false),
        }
        info!(key, value = %value.to_sql(), "tunable changed");
        Ok(true)
    }
}

fn invalid_value(key: &str, value: &Value) -> TabletError {
    TabletError::new(
        ErrorCode::InvalidConfig,
        format!("invalid value for {}: {}", key, value.to_sql()),
    )
    .with_context(ErrorContext::Config {
        file_path: None,
        field: Some(key.to_string()),
    })
}

fn number(key: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Int64(v) => Some(*v as f64),
        Value::Uint64(v) => Some(*v as f64),
        Value::Float64(v) => Some(*v),
        Value::Decimal(s) | Value::Text(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid_value(key, value))
}

fn positive(key: &str, value: &Value) -> Result<u64> {
    match value.as_i64() {
        Some(n) if n > 0 => Ok(n as u64),
        _ => Err(invalid_value(key, value)),
    }
}

/// Collaborators an engine is built from.
pub struct EngineOptions {
    pub config: TabletConfig,
    pub factory: Arc<dyn ConnectionFactory>,
    /// Defaults to reading `information_schema` through the engine's pool
    pub schema_source: Option<Arc<dyn SchemaSource>>,
    /// Defaults to an in-process cache sized by `row_cache.capacity`
    pub cache_service: Option<Arc<dyn CacheService>>,
    pub conflict_parser: Arc<dyn ConflictKeyParser>,
    pub policy: Arc<Policy>,
    pub stats: Arc<TabletStats>,
}

pub struct QueryEngine {
    pub config: TabletConfig,
    pub tunables: Tunables,
    pub schema: Arc<SchemaInfo>,
    pub conn_pool: ConnPool,
    pub stream_pool: ConnPool,
    pub tx_pool: Arc<TxPool>,
    pub row_cache: Option<Arc<RowCache>>,
    pub policy: Arc<Policy>,
    pub conflict_parser: Arc<dyn ConflictKeyParser>,
    pub stats: Arc<TabletStats>,
}

impl QueryEngine {
    pub fn new(options: EngineOptions) -> Self {
        let EngineOptions {
            config,
            factory,
            schema_source,
            cache_service,
            conflict_parser,
            policy,
            stats,
        } = options;

        let idle = config.idle_timeout();
        let conn_pool = ConnPool::new("conn_pool", config.pool_size, idle, factory.clone());
        let stream_pool = ConnPool::new("stream_pool", config.stream_pool_size, idle, factory.clone());
        let tx_pool = Arc::new(TxPool::new(
            ConnPool::new("tx_pool", config.transaction_cap, idle, factory),
            config.transaction_timeout(),
            config.tx_pool_timeout(),
            stats.clone(),
        ));

        let schema_source = schema_source.unwrap_or_else(|| {
            Arc::new(DbSchemaSource::new(conn_pool.clone(), config.pool_timeout()))
        });
        let schema = Arc::new(SchemaInfo::new(
            schema_source,
            config.query_cache_size,
            config.schema_overrides.clone(),
            config.row_cache.enabled,
        ));

        let row_cache = config.row_cache.enabled.then(|| {
            let service = cache_service
                .unwrap_or_else(|| Arc::new(MemoryCacheService::new(config.row_cache.capacity)));
            Arc::new(RowCache::new(
                service,
                config.row_cache.ttl(),
                config.row_cache.timeout(),
                stats.clone(),
            ))
        });

        Self {
            tunables: Tunables::from_config(&config),
            config,
            schema,
            conn_pool,
            stream_pool,
            tx_pool,
            row_cache,
            policy,
            conflict_parser,
            stats,
        }
    }

    /// Load the schema and start the background tasks.
    pub async fn open(&self) -> Result<()> {
        self.schema.open().await.map_err(|e| {
            TabletError::new(ErrorCode::SchemaLoadFailed, format!("cannot load schema: {}", e))
        })?;
        let row_cache = self.row_cache.clone();
        self.schema
            .start_reloader(self.config.schema_reload_time(), move |changed| {
                if let Some(cache) = &row_cache {
                    for table in changed {
                        cache.bump_generation(table);
                    }
                }
            });
        self.tx_pool.start_killer();
        self.update_pool_gauges();
        info!(
            tables = self.schema.table_names().len(),
            row_cache = self.row_cache.is_some(),
            "query engine opened"
        );
        Ok(())
    }

    /// Roll back open transactions, stop background tasks and close pools.
    pub async fn close(&self) {
        self.schema.stop_reloader();
        self.tx_pool.stop_killer();
        self.tx_pool.rollback_all().await;
        self.conn_pool.close();
        self.stream_pool.close();
        self.tx_pool.pool().close();
        self.schema.clear_plans();
        self.update_pool_gauges();
        info!("query engine closed");
    }

    /// Commit and drop the row cache entries the transaction wrote.
    /// Written rows are invalidated whether or not the commit succeeds.
    pub async fn commit(&self, transaction_id: i64) -> Result<()> {
        let mut dirty = DirtyKeys::default();
        let result = self.tx_pool.commit(transaction_id, &mut dirty).await;
        self.invalidate(&dirty).await;
        result
    }

    pub async fn invalidate(&self, dirty: &DirtyKeys) {
        let Some(cache) = &self.row_cache else {
            return;
        };
        for table in &dirty.tables {
            cache.bump_generation(table);
        }
        for (name, pk_rows) in &dirty.keys {
            let Some(table) = self.schema.get_table(name) else {
                continue;
            };
            if !table.is_cached() || dirty.tables.contains(name) {
                continue;
            }
            for pk in pk_rows {
                cache.delete(&table, &table.normalize_pk(pk.clone())).await;
            }
            debug!(target: "cache", table = %name, keys = pk_rows.len(), "invalidated written rows");
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn_pool.get(self.config.pool_timeout()).await?;
        if let Err(e) = conn.execute(HEALTH_CHECK_QUERY).await {
            conn.taint();
            warn!(error = %e, "health check failed");
            return Err(e.into());
        }
        Ok(())
    }

    pub fn update_pool_gauges(&self) {
        for pool in [&self.conn_pool, &self.stream_pool, self.tx_pool.pool()] {
            self.stats
                .pool_available
                .with_label_values(&[pool.name()])
                .set(pool.available() as i64);
        }
    }
}
