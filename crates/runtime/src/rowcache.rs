//! Row cache: full table rows keyed by primary key.
//!
//! # Keys
//!
//! `<table>.<generation>:<pk1>.<pk2>...` with key components in compact
//! encoding. Bumping a table's generation orphans every entry of that table
//! at once; stale entries age out of the backend on their own.
//!
//! # Values
//!
//! JSON-encoded [`CachedRow`]. `Absent` records that the database had no row
//! for the key, so repeated lookups of missing keys stay off the database.
//!
//! # Failure handling
//!
//! The database is authoritative. Backend errors and timeouts are logged and
//! treated as misses; a read never fails because the cache did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tablet_common::{Row, Value};
use tablet_error::Result;
use tablet_sql::Table;
use tracing::{debug, warn};

use crate::stats::TabletStats;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend timed out")]
    Timeout,
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("corrupt cache entry {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

/// A byte-oriented key/value store with per-entry expiry.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Fetch several keys at once. Missing keys are absent from the map.
    async fn get(&self, keys: &[String]) -> std::result::Result<HashMap<String, Vec<u8>>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), CacheError>;

    async fn delete(&self, key: &str) -> std::result::Result<(), CacheError>;
}

#[derive(Clone)]
struct Entry {
    bytes: Arc<Vec<u8>>,
    ttl: Option<Duration>,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process [`CacheService`] on moka's async cache.
#[derive(Clone)]
pub struct MemoryCacheService {
    cache: Cache<String, Entry>,
}

impl MemoryCacheService {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(EntryExpiry)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions and expirations so counts are exact.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

#[async_trait]
impl CacheService for MemoryCacheService {
    async fn get(&self, keys: &[String]) -> std::result::Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.cache.get(key).await {
                found.insert(key.clone(), entry.bytes.as_ref().clone());
            }
        }
        Ok(found)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), CacheError> {
        self.cache
            .insert(
                key.to_string(),
                Entry {
                    bytes: Arc::new(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum CachedRow {
    Row(Row),
    Absent,
}

/// Loads full rows by primary key from the database.
#[async_trait]
pub trait RowFetcher: Send {
    async fn fetch(&mut self, pk_rows: &[Vec<Value>]) -> Result<Vec<Row>>;
}

pub struct RowCache {
    service: Arc<dyn CacheService>,
    generations: Mutex<HashMap<String, u64>>,
    ttl: Option<Duration>,
    timeout: Duration,
    stats: Arc<TabletStats>,
}

impl RowCache {
    pub fn new(
        service: Arc<dyn CacheService>,
        ttl: Option<Duration>,
        timeout: Duration,
        stats: Arc<TabletStats>,
    ) -> Self {
        Self {
            service,
            generations: Mutex::new(HashMap::new()),
            ttl,
            timeout,
            stats,
        }
    }

    /// Current generation of a table. A table first seen starts at its
    /// creation time so that a recreated table never reuses old keys.
    pub fn generation(&self, table: &Table) -> u64 {
        *self
            .generations
            .lock()
            .entry(table.name.clone())
            .or_insert(table.create_time.max(0) as u64)
    }

    /// Invalidate every cached row of the table.
    pub fn bump_generation(&self, table: &str) {
        let mut generations = self.generations.lock();
        let generation = generations.entry(table.to_string()).or_insert(0);
        *generation += 1;
        debug!(target: "cache", table, generation = *generation, "table generation bumped");
        self.stats.row_cache_event(table, "invalidation", 1);
    }

    pub fn key(&self, table: &Table, pk: &[Value]) -> String {
        let components: Vec<String> = pk.iter().map(Value::encode_compact).collect();
        format!(
            "{}.{}:{}",
            table.name,
            self.generation(table),
            components.join(".")
        )
    }

    /// Look up several keys; the result is indexed like `pk_rows`.
    pub async fn get(&self, table: &Table, pk_rows: &[Vec<Value>]) -> Vec<Option<CachedRow>> {
        let keys: Vec<String> = pk_rows.iter().map(|pk| self.key(table, pk)).collect();
        let found = match tokio::time::timeout(self.timeout, self.service.get(&keys)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(target: "cache", table = %table.name, error = %e, "row cache read failed");
                HashMap::new()
            }
            Err(_) => {
                warn!(target: "cache", table = %table.name, error = %CacheError::Timeout, "row cache read failed");
                HashMap::new()
            }
        };
        keys.iter()
            .map(|key| {
                let bytes = found.get(key)?;
                match serde_json::from_slice::<CachedRow>(bytes) {
                    Ok(row) => Some(row),
                    Err(e) => {
                        let err = CacheError::Corrupt {
                            key: key.clone(),
                            detail: e.to_string(),
                        };
                        warn!(target: "cache", error = %err, "ignoring cache entry");
                        None
                    }
                }
            })
            .collect()
    }

    pub async fn set(&self, table: &Table, pk: &[Value], row: &CachedRow) {
        let key = self.key(table, pk);
        let bytes = match serde_json::to_vec(row) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "cache", key = %key, error = %e, "cannot encode cache entry");
                return;
            }
        };
        match tokio::time::timeout(self.timeout, self.service.set(&key, bytes, self.ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "cache", key = %key, error = %e, "row cache write failed"),
            Err(_) => warn!(target: "cache", key = %key, "row cache write timed out"),
        }
    }

    pub async fn delete(&self, table: &Table, pk: &[Value]) {
        let key = self.key(table, pk);
        match tokio::time::timeout(self.timeout, self.service.delete(&key)).await {
            Ok(Ok(())) => self.stats.row_cache_event(&table.name, "invalidation", 1),
            Ok(Err(e)) => warn!(target: "cache", key = %key, error = %e, "row cache delete failed"),
            Err(_) => warn!(target: "cache", key = %key, "row cache delete timed out"),
        }
    }

    /// Rows for `pk_rows` in key order, missing keys skipped.
    ///
    /// Hits are returned from the cache. A `spot_check_ratio` share of hits is
    /// re-read from the database and, on disagreement, the database row wins
    /// and the entry is dropped. Misses are read in one batch and cached,
    /// keys without a row as `Absent`. Rows the database returns under a key
    /// spelled differently from the request are returned after the others
    /// and cached under their own key; while any such row exists, a key
    /// without a row is not recorded as absent.
    pub async fn read_through(
        &self,
        table: &Table,
        pk_rows: &[Vec<Value>],
        spot_check_ratio: f64,
        fetcher: &mut dyn RowFetcher,
    ) -> Result<Vec<Row>> {
        let cached = self.get(table, pk_rows).await;
        let mut resolved: Vec<Option<CachedRow>> = Vec::with_capacity(pk_rows.len());
        let mut misses = Vec::new();
        let mut spot = Vec::new();
        let (mut hits, mut absent) = (0u64, 0u64);
        {
            let mut rng = rand::thread_rng();
            for (i, entry) in cached.into_iter().enumerate() {
                match entry {
                    Some(row) => {
                        match row {
                            CachedRow::Row(_) => hits += 1,
                            CachedRow::Absent => absent += 1,
                        }
                        if spot_check_ratio > 0.0 && rng.gen::<f64>() < spot_check_ratio {
                            spot.push(i);
                        }
                        resolved.push(Some(row));
                    }
                    None => {
                        misses.push(i);
                        resolved.push(None);
                    }
                }
            }
        }
        self.stats.row_cache_event(&table.name, "hit", hits);
        self.stats.row_cache_event(&table.name, "absent", absent);
        self.stats.row_cache_event(&table.name, "miss", misses.len() as u64);

        let mut unmatched = Vec::new();
        if !spot.is_empty() {
            let keys: Vec<Vec<Value>> = spot.iter().map(|&i| pk_rows[i].clone()).collect();
            let fresh = match_rows(table, &keys, fetcher.fetch(&keys).await?);
            let exact = fresh.unmatched.is_empty();
            for (&i, row) in spot.iter().zip(fresh.matched) {
                self.stats.spot_checks.inc();
                let actual = match row {
                    Some(row) => Some(CachedRow::Row(row)),
                    None if exact => Some(CachedRow::Absent),
                    None => None,
                };
                if resolved[i] != actual {
                    self.stats.spot_check_mismatches.inc();
                    warn!(
                        target: "cache",
                        table = %table.name,
                        key = %self.key(table, &pk_rows[i]),
                        "spot check mismatch, dropping cached row"
                    );
                    self.delete(table, &pk_rows[i]).await;
                    resolved[i] = actual;
                }
            }
            unmatched.extend(fresh.unmatched);
        }

        if !misses.is_empty() {
            let keys: Vec<Vec<Value>> = misses.iter().map(|&i| pk_rows[i].clone()).collect();
            let fresh = match_rows(table, &keys, fetcher.fetch(&keys).await?);
            let exact = fresh.unmatched.is_empty();
            for (&i, row) in misses.iter().zip(fresh.matched) {
                let entry = match row {
                    Some(row) => CachedRow::Row(row),
                    None if exact => CachedRow::Absent,
                    None => continue,
                };
                self.set(table, &pk_rows[i], &entry).await;
                resolved[i] = Some(entry);
            }
            unmatched.extend(fresh.unmatched);
        }

        for row in &unmatched {
            let pk = table.normalize_pk(table.pk_of_row(row));
            debug!(target: "cache", table = %table.name, key = %self.key(table, &pk), "row returned under a different key");
            self.set(table, &pk, &CachedRow::Row(row.clone())).await;
        }

        let mut rows: Vec<Row> = resolved
            .into_iter()
            .filter_map(|entry| match entry {
                Some(CachedRow::Row(row)) => Some(row),
                _ => None,
            })
            .collect();
        rows.extend(unmatched);
        Ok(rows)
    }
}

/// Comparable form of a key, insensitive to how numbers were typed.
fn pk_key(pk: &[Value]) -> Vec<String> {
    pk.iter()
        .map(|v| match v {
            Value::Text(s) | Value::Decimal(s) => s.clone(),
            other => other.to_sql(),
        })
        .collect()
}

/// Fetched rows paired with the requested keys.
struct MatchedRows {
    /// Indexed like the requested keys.
    matched: Vec<Option<Row>>,
    /// Rows whose key is not spelled like any requested key, as with
    /// case-insensitive collations, trailing spaces or decimal formatting.
    unmatched: Vec<Row>,
}

fn match_rows(table: &Table, pk_rows: &[Vec<Value>], rows: Vec<Row>) -> MatchedRows {
    let wanted: HashMap<Vec<String>, usize> = pk_rows
        .iter()
        .enumerate()
        .map(|(i, pk)| (pk_key(pk), i))
        .collect();
    let mut matched: Vec<Option<Row>> = vec![None; pk_rows.len()];
    let mut unmatched = Vec::new();
    for row in rows {
        match wanted.get(&pk_key(&table.pk_of_row(&row))) {
            Some(&i) if matched[i].is_none() => matched[i] = Some(row),
            _ => unmatched.push(row),
        }
    }
    MatchedRows { matched, unmatched }
}

/// Arrange full table rows in the order of `pk_rows`. Rows matching no key
/// by spelling follow in the order the database sent them.
pub fn order_by_keys(table: &Table, pk_rows: &[Vec<Value>], rows: Vec<Row>) -> Vec<Row> {
    let MatchedRows { matched, unmatched } = match_rows(table, pk_rows, rows);
    matched.into_iter().flatten().chain(unmatched).collect()
}
