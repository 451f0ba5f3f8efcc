//! Content-hash result cache.
//!
//! [`Cache`] sits between the processor and a durable [`CacheStore`]. All
//! records are loaded into memory when the cache is opened, so lookups never
//! touch storage. Writes go to the store first and only then replace the
//! in-memory record, one key at a time.
//!
//! # Keys
//!
//! A [`CacheKey`] carries the file path, its fingerprint, and the task-kind
//! signature. [`CacheKeyMode`] decides which of these name the stored record:
//!
//! | Mode | Record key | Renamed, unchanged file |
//! |------|------------|-------------------------|
//! | `content` | fingerprint + signature | hit |
//! | `path` | path | miss (treated as new) |
//!
//! In both modes a hit requires the stored fingerprint and signature to match
//! the current ones exactly.
//!
//! # Bypass
//!
//! With `bypass` set, every lookup misses but writes still land, so entries
//! refreshed during a forced re-analysis serve later normal runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::fingerprint::FingerprintId;
use crate::migrate;
use crate::report::Report;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheKeyMode {
    /// Key by content fingerprint only.
    #[default]
    Content,
    /// Key by path; the fingerprint still has to match.
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub path: String,
    pub fingerprint: FingerprintId,
    pub task_signature: String,
}

impl CacheKey {
    /// Name of the stored record for this key under `mode`.
    pub fn record_key(&self, mode: CacheKeyMode) -> String {
        match mode {
            CacheKeyMode::Content => {
                format!("content:{}:{}", self.fingerprint, self.task_signature)
            }
            CacheKeyMode::Path => format!("path:{}", self.path),
        }
    }
}

/// A cached report and the identity it was produced for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: FingerprintId,
    pub task_signature: String,
    pub report: Report,
    /// Source paths that currently resolve to this record.
    #[serde(default)]
    pub paths: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Paths holding this record; records written without a path list
    /// belong to the path in their report header.
    fn holders(&self) -> Vec<String> {
        if self.paths.is_empty() {
            vec![self.report.header.path.clone()]
        } else {
            self.paths.iter().cloned().collect()
        }
    }
}

/// A raw record as held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub payload: String,
}

/// Durable storage behind a [`Cache`].
///
/// `upsert` must replace the record for `key` atomically: a reader sees
/// either the old payload or the new one, never a mix.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<StoredRecord>>;
    async fn upsert(&self, key: &str, payload: &str, created_at: i64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Remove every record, returning how many were removed.
    async fn clear(&self) -> Result<u64>;
    async fn close(&self);
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    async fn load_all(&self) -> Result<Vec<StoredRecord>> {
        (**self).load_all().await
    }
    async fn upsert(&self, key: &str, payload: &str, created_at: i64) -> Result<()> {
        (**self).upsert(key, payload, created_at).await
    }
    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
    async fn clear(&self) -> Result<u64> {
        (**self).clear().await
    }
    async fn close(&self) {
        (**self).close().await
    }
}

// ============ SQLite Store ============

/// One row per record key in a local SQLite file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::cache_io(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Record count and the oldest/newest write times (Unix seconds).
    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS records, MIN(created_at) AS oldest, MAX(created_at) AS newest \
             FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            records: row.get::<i64, _>("records") as u64,
            oldest: row.get("oldest"),
            newest: row.get("newest"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub records: u64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query("SELECT key, payload FROM cache_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| StoredRecord {
                key: row.get("key"),
                payload: row.get("payload"),
            })
            .collect())
    }

    async fn upsert(&self, key: &str, payload: &str, created_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, payload, created_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ============ In-Memory Store ============

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw record, bypassing any validation.
    pub fn with_record(self, key: &str, payload: &str) -> Self {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), payload.to_string());
        self
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut out: Vec<StoredRecord> = records
            .iter()
            .map(|(key, payload)| StoredRecord {
                key: key.clone(),
                payload: payload.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn upsert(&self, key: &str, payload: &str, _created_at: i64) -> Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), payload.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut records = self.records.write().map_err(poisoned)?;
        let n = records.len() as u64;
        records.clear();
        Ok(n)
    }

    async fn close(&self) {}
}

// ============ Cache ============

enum Slot {
    Entry(CacheEntry),
    /// The stored payload could not be decoded.
    Corrupt(String),
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Slot>,
    /// Source path to the record key it currently resolves to.
    owners: HashMap<String, String>,
}

/// The shared result cache used by the processor.
///
/// Every record remembers the paths that resolve to it. When a path moves to
/// a new record, the old one loses that path and is deleted once no path
/// holds it, so edited files do not leave stale rows behind.
pub struct Cache {
    store: Box<dyn CacheStore>,
    mode: CacheKeyMode,
    bypass: bool,
    index: RwLock<Index>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Cache {
    /// Load every record from `store`. Undecodable records are kept as
    /// corrupt slots; looking one up yields [`PipelineError::CacheIo`].
    pub async fn open(store: Box<dyn CacheStore>, mode: CacheKeyMode, bypass: bool) -> Result<Self> {
        let records = store.load_all().await?;
        let mut index = Index::default();
        for record in records {
            let slot = match serde_json::from_str::<CacheEntry>(&record.payload) {
                Ok(entry) => {
                    for path in entry.holders() {
                        index.owners.insert(path, record.key.clone());
                    }
                    Slot::Entry(entry)
                }
                Err(e) => {
                    warn!(key = %record.key, error = %e, "undecodable cache record");
                    Slot::Corrupt(e.to_string())
                }
            };
            index.slots.insert(record.key, slot);
        }
        debug!(records = index.slots.len(), ?mode, bypass, "cache opened");

        Ok(Self {
            store,
            mode,
            bypass,
            index: RwLock::new(index),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Open an empty, non-durable cache.
    pub async fn in_memory(mode: CacheKeyMode, bypass: bool) -> Result<Self> {
        Self::open(Box::new(MemoryStore::new()), mode, bypass).await
    }

    pub fn mode(&self) -> CacheKeyMode {
        self.mode
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Look up a previous result for `key`.
    ///
    /// Returns `Ok(None)` on a miss, including when the stored fingerprint or
    /// task signature differs from the key's.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if self.bypass {
            return Ok(None);
        }
        let record_key = key.record_key(self.mode);
        let index = self.read_index()?;
        match index.slots.get(&record_key) {
            None => Ok(None),
            Some(Slot::Corrupt(reason)) => Err(PipelineError::cache_io(format!(
                "corrupt record '{}': {}",
                record_key, reason
            ))),
            Some(Slot::Entry(entry)) => {
                if entry.fingerprint == key.fingerprint && entry.task_signature == key.task_signature
                {
                    Ok(Some(entry.clone()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// The record `path` currently resolves to, whatever its fingerprint.
    pub fn entry_for_path(&self, path: &str) -> Result<Option<CacheEntry>> {
        let index = self.read_index()?;
        let entry = index
            .owners
            .get(path)
            .and_then(|record_key| match index.slots.get(record_key) {
                Some(Slot::Entry(entry)) => Some(entry.clone()),
                _ => None,
            });
        Ok(entry)
    }

    /// Store `report` as the result for `key`, replacing any previous record.
    ///
    /// Writers to the same record are serialized; the in-memory view changes
    /// only after the store accepted the write. The record `key.path` held
    /// before is released.
    pub async fn put(&self, key: &CacheKey, report: Report) -> Result<()> {
        let record_key = key.record_key(self.mode);
        let previous = self
            .read_index()?
            .owners
            .get(&key.path)
            .filter(|held| **held != record_key)
            .cloned();

        // Lock in key order so two writers never wait on each other.
        let mut lock_keys = vec![record_key.clone()];
        lock_keys.extend(previous.iter().cloned());
        lock_keys.sort();
        let locks = lock_keys
            .iter()
            .map(|k| self.key_lock(k))
            .collect::<Result<Vec<_>>>()?;
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        let result = self
            .replace(key, &record_key, previous.as_deref(), report)
            .await;

        drop(guards);
        for (k, lock) in lock_keys.iter().zip(locks) {
            self.release_lock(k, lock);
        }
        result
    }

    /// Make `key.path` resolve to the record its content already has, as
    /// after a content-mode hit under a new path.
    pub async fn adopt(&self, key: &CacheKey) -> Result<()> {
        let record_key = key.record_key(self.mode);
        let report = {
            let index = self.read_index()?;
            if index.owners.get(&key.path) == Some(&record_key) {
                return Ok(());
            }
            match index.slots.get(&record_key) {
                Some(Slot::Entry(entry)) => entry.report.clone(),
                _ => return Ok(()),
            }
        };
        self.put(key, report).await
    }

    /// Drop the record for `key`, if any.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let record_key = key.record_key(self.mode);
        let lock = self.key_lock(&record_key)?;
        let guard = lock.lock().await;

        let result = self.remove_record(&record_key).await;

        drop(guard);
        self.release_lock(&record_key, lock);
        result
    }

    /// Remove every record from the store and the in-memory view.
    pub async fn clear(&self) -> Result<u64> {
        let n = self.store.clear().await?;
        let mut index = self.write_index()?;
        index.slots.clear();
        index.owners.clear();
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records that failed to decode on open.
    pub fn corrupt_count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Corrupt(_)))
            .count()
    }

    /// Flush and release the underlying store.
    pub async fn close(&self) {
        self.store.close().await;
    }

    async fn replace(
        &self,
        key: &CacheKey,
        record_key: &str,
        previous: Option<&str>,
        report: Report,
    ) -> Result<()> {
        let mut paths = match self.read_index()?.slots.get(record_key) {
            Some(Slot::Entry(existing)) => existing.paths.clone(),
            _ => BTreeSet::new(),
        };
        paths.insert(key.path.clone());

        let entry = CacheEntry {
            fingerprint: key.fingerprint.clone(),
            task_signature: key.task_signature.clone(),
            report,
            paths,
            created_at: Utc::now(),
        };
        self.store
            .upsert(record_key, &encode(&entry)?, entry.created_at.timestamp())
            .await?;
        {
            let mut index = self.write_index()?;
            index.slots.insert(record_key.to_string(), Slot::Entry(entry));
            index.owners.insert(key.path.clone(), record_key.to_string());
        }

        if let Some(previous) = previous {
            self.release_path(previous, &key.path).await?;
        }
        Ok(())
    }

    /// Detach `path` from `record_key`, deleting the record once no path
    /// holds it.
    async fn release_path(&self, record_key: &str, path: &str) -> Result<()> {
        let remaining = match self.read_index()?.slots.get(record_key) {
            Some(Slot::Entry(entry)) => {
                let mut entry = entry.clone();
                entry.paths.remove(path);
                entry
            }
            _ => return Ok(()),
        };

        if remaining.paths.is_empty() {
            debug!(key = record_key, path, "dropping superseded cache record");
            return self.remove_record(record_key).await;
        }
        self.store
            .upsert(record_key, &encode(&remaining)?, remaining.created_at.timestamp())
            .await?;
        self.write_index()?
            .slots
            .insert(record_key.to_string(), Slot::Entry(remaining));
        Ok(())
    }

    async fn remove_record(&self, record_key: &str) -> Result<()> {
        self.store.delete(record_key).await?;
        let mut index = self.write_index()?;
        index.slots.remove(record_key);
        index.owners.retain(|_, held| held != record_key);
        Ok(())
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, Index>> {
        self.index.read().map_err(poisoned)
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, Index>> {
        self.index.write().map_err(poisoned)
    }

    fn key_lock(&self, record_key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        Ok(self
            .write_locks
            .lock()
            .map_err(poisoned)?
            .entry(record_key.to_string())
            .or_default()
            .clone())
    }

    /// Forget the lock for `record_key` once no other writer holds a handle.
    fn release_lock(&self, record_key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One handle in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(record_key);
        }
    }

    #[cfg(test)]
    fn pending_locks(&self) -> usize {
        self.write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn encode(entry: &CacheEntry) -> Result<String> {
    serde_json::to_string(entry).map_err(|e| PipelineError::cache_io(format!("encode entry: {}", e)))
}

fn poisoned<T>(_: PoisonError<T>) -> PipelineError {
    PipelineError::cache_io("cache lock poisoned by a panicked writer")
}
