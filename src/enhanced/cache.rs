//! Caching Layer
//!
//! Two-tier TTL cache for upstream responses, keyed by resource name plus
//! canonical parameters.
//!
//! - **Memory tier**: bounded by `max_entries`; inserting past the bound
//!   evicts the entry with the oldest last access.
//! - **Durable tier** (optional): any [`DurableStore`]; [`FileStore`] keeps
//!   one JSON file per entry. Durable failures are logged and treated as
//!   misses.
//!
//! TTL resolution on `set`: explicit override, else the first
//! [`TtlRules`] pattern contained in the resource name, else the default.
//! `get` never returns an expired entry from either tier.
//!
//! ## Usage
//!
//! ```no_run
//! use serde_json::json;
//! use tokio_upstream_orchestrator::config::CacheConfig;
//! use tokio_upstream_orchestrator::enhanced::cache::{CacheLayer, SetOptions};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheLayer::from_config(&CacheConfig::default())?;
//! let params = json!({"page": 1});
//!
//! if cache.get("item_list", &params).await.is_none() {
//!     let fetched = json!(["a", "b"]);
//!     cache.set("item_list", &params, fetched, SetOptions::default()).await;
//! }
//! # Ok(()) }
//! ```

use crate::config::CacheConfig;
use crate::enhanced::priority::Priority;
use crate::metrics;
use crate::request::params_hash;
use crate::OrchestratorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache key for a resource and its parameters: `"{resource}:{params_hash}"`.
///
/// Parameter key order does not affect the key.
pub fn cache_key(resource: &str, params: &Value) -> String {
    format!("{resource}:{}", params_hash(params))
}

/// Resource part of a [`cache_key`]. The params hash never contains `':'`.
pub fn key_resource(key: &str) -> &str {
    key.rsplit_once(':').map_or(key, |(resource, _)| resource)
}

/// Ordered substring → TTL rules with a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlRules {
    rules: Vec<(String, Duration)>,
    default_ttl: Duration,
}

impl TtlRules {
    /// Rules checked in order; `default_ttl` when none match.
    pub fn new(rules: Vec<(String, Duration)>, default_ttl: Duration) -> Self {
        Self { rules, default_ttl }
    }

    /// Build from the `[cache]` config section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config
                .ttl_rules
                .iter()
                .map(|r| (r.pattern.clone(), Duration::from_millis(r.ttl_ms)))
                .collect(),
            Duration::from_millis(config.default_ttl_ms),
        )
    }

    /// TTL for `resource`.
    pub fn resolve(&self, resource: &str) -> Duration {
        self.rules
            .iter()
            .find(|(pattern, _)| resource.contains(pattern.as_str()))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }
}

/// Per-call options for [`CacheLayer::set`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// TTL override.
    pub ttl: Option<Duration>,
    /// Entry priority. `High` and `Critical` entries are mirrored to the
    /// durable tier unless `persist` says otherwise.
    pub priority: Priority,
    /// Force (or suppress) mirroring to the durable tier.
    pub persist: Option<bool>,
}

impl SetOptions {
    /// Options with only a TTL override.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Force or suppress durable mirroring.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    fn should_persist(&self) -> bool {
        self.persist.unwrap_or(self.priority >= Priority::High)
    }
}

// ── Durable tier ─────────────────────────────────────────────────────────

/// Durable tier errors. Never surfaced to cache callers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("durable store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored record could not be (de)serialized.
    #[error("durable store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One durable entry. Expiry is wall-clock so it survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    /// Cache key.
    pub key: String,
    /// Cached value.
    pub value: Value,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Write instant.
    pub stored_at: DateTime<Utc>,
    /// Priority given at `set`, restored on promotion.
    #[serde(default)]
    pub priority: Priority,
}

impl DurableRecord {
    /// Whether the record is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage behind the durable tier.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a record.
    async fn load(&self, key: &str) -> Result<Option<DurableRecord>, StoreError>;
    /// Write a record, replacing any previous one.
    async fn save(&self, record: &DurableRecord) -> Result<(), StoreError>;
    /// Remove a record. Missing records are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Remove every record whose resource name contains `pattern`. Returns how many.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError>;
    /// Remove every record expired at `now`. Returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
    /// Remove every record.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Directory of JSON files, one per key.
///
/// File names are the hex SHA-256 of the key, so any key is a valid name.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    async fn read_record(path: &Path) -> Result<Option<DurableRecord>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every record for which `doomed` holds. Unreadable files are removed too.
    async fn retain<F>(&self, doomed: F) -> Result<usize, StoreError>
    where
        F: Fn(&DurableRecord) -> bool + Send,
    {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let delete = match Self::read_record(&path).await {
                Ok(Some(record)) => doomed(&record),
                Ok(None) => false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "removing unreadable cache file");
                    true
                }
            };
            if delete {
                Self::remove(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<DurableRecord>, StoreError> {
        Self::read_record(&self.path_for(key)).await
    }

    async fn save(&self, record: &DurableRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Self::remove(&self.path_for(key)).await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        self
            .retain(|record| key_resource(&record.key).contains(pattern))
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.retain(|record| record.is_expired(now)).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.retain(|_| true).await.map(|_| ())
    }
}

// ── Memory tier ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
    last_accessed_at: Instant,
    access_seq: u64,
    hits: u64,
    size_bytes: usize,
    priority: Priority,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    durable_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    /// Lookups served from either tier.
    pub hits: u64,
    /// Lookups that found nothing live.
    pub misses: u64,
    /// `hits + misses`.
    pub total_requests: u64,
    /// `hits / total_requests`, 0 when idle.
    pub hit_rate: f64,
    /// `misses / total_requests`, 0 when idle.
    pub miss_rate: f64,
    /// Hits served by promoting a durable entry.
    pub durable_hits: u64,
    /// Memory entries evicted by the size bound.
    pub evictions: u64,
    /// Expired entries removed on read or purge.
    pub expirations: u64,
    /// Entries in the memory tier.
    pub size: usize,
    /// Memory tier bound.
    pub max_entries: usize,
    /// Approximate serialized size of the memory tier.
    pub memory_bytes: usize,
    /// Whether a durable tier is attached.
    pub durable: bool,
}

/// Access metadata for one memory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    /// Time left before expiry.
    pub ttl_remaining: Duration,
    /// Hits since the entry was written.
    pub hits: u64,
    /// Priority given at `set`.
    pub priority: Priority,
    /// Approximate serialized size.
    pub size_bytes: usize,
}

/// Two-tier response cache.
#[derive(Clone)]
pub struct CacheLayer {
    memory: Arc<DashMap<String, CacheEntry>>,
    durable: Option<Arc<dyn DurableStore>>,
    ttl_rules: TtlRules,
    max_entries: usize,
    access_seq: Arc<AtomicU64>,
    counters: Arc<CacheCounters>,
}

impl CacheLayer {
    /// Create a memory-only cache.
    pub fn new_memory(max_entries: usize, ttl_rules: TtlRules) -> Self {
        Self {
            memory: Arc::new(DashMap::new()),
            durable: None,
            ttl_rules,
            max_entries: max_entries.max(1),
            access_seq: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Attach a durable tier.
    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Build from the `[cache]` config section, opening a [`FileStore`] when
    /// `durable_dir` is set.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] if the durable directory cannot
    /// be created.
    pub fn from_config(config: &CacheConfig) -> Result<Self, OrchestratorError> {
        let cache = Self::new_memory(config.max_entries, TtlRules::from_config(config));
        match &config.durable_dir {
            Some(dir) => {
                let store = FileStore::open(dir)?;
                info!(dir = %dir.display(), "durable cache tier enabled");
                Ok(cache.with_durable(Arc::new(store)))
            }
            None => Ok(cache),
        }
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("hit");
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("miss");
    }

    fn record_expiration(&self) {
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("expiration");
    }

    /// Look up a live value, memory first, then the durable tier.
    pub async fn get(&self, resource: &str, params: &Value) -> Option<Value> {
        let key = cache_key(resource, params);
        let now = Instant::now();

        if let Some(mut entry) = self.memory.get_mut(&key) {
            if entry.expires_at > now {
                entry.last_accessed_at = now;
                entry.access_seq = self.next_seq();
                entry.hits += 1;
                let value = entry.value.clone();
                drop(entry);
                self.record_hit();
                debug!(key = %key, "cache hit (memory)");
                return Some(value);
            }
        }
        if self
            .memory
            .remove_if(&key, |_, entry| entry.expires_at <= now)
            .is_some()
        {
            self.record_expiration();
            debug!(key = %key, "cache entry expired (memory)");
        }

        if let Some(value) = self.get_durable(&key).await {
            self.record_hit();
            return Some(value);
        }

        self.record_miss();
        debug!(key = %key, "cache miss");
        None
    }

    async fn get_durable(&self, key: &str) -> Option<Value> {
        let store = self.durable.as_ref()?;
        let record = match store.load(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = key, error = %e, "durable cache read failed");
                return None;
            }
        };

        let now = Utc::now();
        let remaining = (record.expires_at - now).to_std().ok().filter(|d| !d.is_zero());
        let Some(remaining) = remaining else {
            if let Err(e) = store.delete(key).await {
                warn!(key = key, error = %e, "failed to delete expired durable entry");
            }
            self.record_expiration();
            debug!(key = key, "cache entry expired (durable)");
            return None;
        };

        self.insert_memory(key.to_string(), record.value.clone(), remaining, record.priority);
        self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("durable_hit");
        debug!(key = key, ttl_ms = remaining.as_millis() as u64, "cache hit (durable), promoted");
        Some(record.value)
    }

    /// Store a value. Always writes memory; mirrors to the durable tier when
    /// the options ask for it.
    pub async fn set(&self, resource: &str, params: &Value, value: Value, options: SetOptions) {
        let key = cache_key(resource, params);
        let ttl = options.ttl.unwrap_or_else(|| self.ttl_rules.resolve(resource));

        if options.should_persist() {
            if let Some(store) = &self.durable {
                let now = Utc::now();
                let expires_at = chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let record = DurableRecord {
                    key: key.clone(),
                    value: value.clone(),
                    expires_at,
                    stored_at: now,
                    priority: options.priority,
                };
                if let Err(e) = store.save(&record).await {
                    warn!(key = %key, error = %e, "durable cache write failed");
                }
            }
        }

        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, priority = %options.priority, "cached");
        self.insert_memory(key, value, ttl, options.priority);
    }

    fn insert_memory(&self, key: String, value: Value, ttl: Duration, priority: Priority) {
        let now = Instant::now();
        let size_bytes = key.len() + serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or(now + Duration::from_secs(86_400 * 365));
        self.memory.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at,
                last_accessed_at: now,
                access_seq: self.next_seq(),
                hits: 0,
                size_bytes,
                priority,
            },
        );
        self.evict_over_capacity(&key);
    }

    /// Evict least-recently-accessed entries (never `keep`) until within bounds.
    fn evict_over_capacity(&self, keep: &str) {
        while self.memory.len() > self.max_entries {
            // Collect the victim first so no read guard is held during remove.
            let victim = self
                .memory
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| (e.last_accessed_at, e.access_seq))
                .map(|e| e.key().clone());
            let Some(victim) = victim else {
                break;
            };
            if self.memory.remove(&victim).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("eviction");
                debug!(key = %victim, "evicted least recently used entry");
            }
        }
    }

    /// Typed [`get`](Self::get). A value that does not deserialize is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, resource: &str, params: &Value) -> Option<T> {
        let value = self.get(resource, params).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(resource = resource, error = %e, "cached value has unexpected shape");
                None
            }
        }
    }

    /// Typed [`set`](Self::set). Values that do not serialize are skipped.
    pub async fn set_as<T: Serialize>(
        &self,
        resource: &str,
        params: &Value,
        value: &T,
        options: SetOptions,
    ) {
        match serde_json::to_value(value) {
            Ok(value) => self.set(resource, params, value, options).await,
            Err(e) => warn!(resource = resource, error = %e, "value not cacheable"),
        }
    }

    /// Remove one entry from both tiers.
    pub async fn invalidate(&self, resource: &str, params: &Value) {
        let key = cache_key(resource, params);
        self.memory.remove(&key);
        if let Some(store) = &self.durable {
            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "durable cache delete failed");
            }
        }
        debug!(key = %key, "invalidated");
    }

    /// Remove every entry whose resource name contains `pattern` from both
    /// tiers. Returns how many memory entries were removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let before = self.memory.len();
        self.memory
            .retain(|key, _| !key_resource(key).contains(pattern));
        let removed = before.saturating_sub(self.memory.len());

        if let Some(store) = &self.durable {
            if let Err(e) = store.delete_matching(pattern).await {
                warn!(pattern = pattern, error = %e, "durable cache pattern delete failed");
            }
        }
        info!(pattern = pattern, removed = removed, "invalidated by pattern");
        removed
    }

    /// Remove every entry from both tiers.
    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(store) = &self.durable {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "durable cache clear failed");
            }
        }
        info!("cache cleared");
    }

    /// Drop expired entries from both tiers. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.memory.len();
        self.memory.retain(|_, entry| entry.expires_at > now);
        let mut removed = before.saturating_sub(self.memory.len());

        if let Some(store) = &self.durable {
            match store.purge_expired(Utc::now()).await {
                Ok(n) => removed += n,
                Err(e) => warn!(error = %e, "durable cache purge failed"),
            }
        }
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Access metadata for a live memory entry.
    pub fn entry_info(&self, resource: &str, params: &Value) -> Option<EntryInfo> {
        let now = Instant::now();
        let entry = self.memory.get(&cache_key(resource, params))?;
        (entry.expires_at > now).then(|| EntryInfo {
            ttl_remaining: entry.expires_at.saturating_duration_since(now),
            hits: entry.hits,
            priority: entry.priority,
            size_bytes: entry.size_bytes,
        })
    }

    /// Get cache statistics
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let rate = |n: u64| {
            if total_requests == 0 {
                0.0
            } else {
                n as f64 / total_requests as f64
            }
        };
        CacheMetrics {
            hits,
            misses,
            total_requests,
            hit_rate: rate(hits),
            miss_rate: rate(misses),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size: self.memory.len(),
            max_entries: self.max_entries,
            memory_bytes: self.memory.iter().map(|e| e.size_bytes).sum(),
            durable: self.durable.is_some(),
        }
    }
}
