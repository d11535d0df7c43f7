//! Size- and optionally time-bounded key/value cache with LRU eviction.
//!
//! Every namespace is mirrored into a [`SessionStorage`] slot as one JSON
//! blob. Persistence is best-effort: when an insert cannot be written
//! (quota exceeded, storage gone) the oldest half of the other entries is
//! dropped and the write is retried once. If the retry fails too, the cache
//! keeps working in memory and stops dropping entries until a write succeeds.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::storage::{SessionStorage, StorageResult};
use crate::utils::Clock;

/// Share of entries dropped when an insert overflows the cache.
pub const DEFAULT_EVICTION_FRACTION: f64 = 0.25;

/// Share of entries dropped when the persistence slot rejects a write.
pub const DEFAULT_EMERGENCY_FRACTION: f64 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum CacheError {
    #[error("Invalid configuration for cache '{namespace}': {reason}")]
    InvalidConfig { namespace: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Orders accesses that share a timestamp
    #[serde(default)]
    pub access_seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.map(|ttl| now - self.created_at > ttl).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Storage key the snapshot is written under
    pub namespace: String,
    pub max_entries: usize,
    pub ttl: Option<Duration>,
    pub eviction_fraction: f64,
    pub emergency_fraction: f64,
}

impl CacheConfig {
    pub fn new(namespace: impl Into<String>, max_entries: usize) -> Self {
        Self {
            namespace: namespace.into(),
            max_entries,
            ttl: None,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
            emergency_fraction: DEFAULT_EMERGENCY_FRACTION,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction;
        self
    }

    pub fn with_emergency_fraction(mut self, fraction: f64) -> Self {
        self.emergency_fraction = fraction;
        self
    }

    fn validate(&self) -> Result<(), CacheError> {
        let invalid = |reason: &str| CacheError::InvalidConfig {
            namespace: self.namespace.clone(),
            reason: reason.to_string(),
        };

        if self.namespace.is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        if self.max_entries == 0 {
            return Err(invalid("max_entries must be at least 1"));
        }
        for fraction in [self.eviction_fraction, self.emergency_fraction] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(invalid("eviction fractions must be in (0, 1]"));
            }
        }
        if let Some(ttl) = self.ttl {
            if ttl <= Duration::zero() {
                return Err(invalid("ttl must be positive"));
            }
        }
        Ok(())
    }
}

/// A successful lookup. Expired values are still handed out; the caller
/// decides whether to use them while refreshing.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<V> {
    pub value: V,
    pub is_expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    pub size: usize,
    pub max_entries: usize,
    pub ttl_hours: Option<i64>,
    pub eviction_fraction: f64,
    pub emergency_fraction: f64,
    /// Access time of the next entry to be evicted
    pub oldest_access: Option<DateTime<Utc>>,
    /// Writes that still failed after emergency cleanup
    pub persist_failures: u64,
}

pub struct BoundedCache<K, V> {
    config: CacheConfig,
    entries: HashMap<K, CacheEntry<V>>,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    next_seq: u64,
    persist_failures: u64,
    /// Set after a failed retry, cleared by the next successful write
    memory_only: bool,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Create a cache and load whatever snapshot its namespace holds.
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let entries = Self::load_snapshot(&config.namespace, storage.as_ref());
        let next_seq = entries
            .values()
            .map(|e| e.access_seq + 1)
            .max()
            .unwrap_or(0);

        let mut cache = Self {
            config,
            entries,
            storage,
            clock,
            next_seq,
            persist_failures: 0,
            memory_only: false,
        };

        // A snapshot written under a larger limit may not fit anymore
        if cache.entries.len() > cache.config.max_entries {
            cache.evict_over_capacity(None);
            cache.persist(None);
        }

        Ok(cache)
    }

    fn load_snapshot(
        namespace: &str,
        storage: &dyn SessionStorage,
    ) -> HashMap<K, CacheEntry<V>> {
        match storage.get_item(namespace) {
            Ok(Some(contents)) => match serde_json::from_str::<HashMap<K, CacheEntry<V>>>(&contents) {
                Ok(entries) => {
                    debug!(namespace = namespace, count = entries.len(), "Loaded cache snapshot");
                    entries
                }
                Err(e) => {
                    warn!(namespace = namespace, error = %e, "Discarding unreadable cache snapshot");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(namespace = namespace, error = %e, "Failed to load cache snapshot");
                HashMap::new()
            }
        }
    }

    /// Look up a key, marking it as most recently used.
    pub fn get(&mut self, key: &K) -> Option<CacheHit<V>> {
        let now = self.clock.now();
        let entry = self.entries.get_mut(key)?;

        let is_expired = entry.is_expired(self.config.ttl, now);
        entry.last_accessed_at = now;
        entry.access_seq = self.next_seq;
        self.next_seq += 1;

        let hit = CacheHit {
            value: entry.value.clone(),
            is_expired,
        };
        self.persist_recency();
        Some(hit)
    }

    /// Check for a key without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite a value. Overwriting restarts the entry's TTL.
    pub fn set(&mut self, key: K, value: V) {
        let now = self.clock.now();
        let entry = CacheEntry {
            value,
            last_accessed_at: now,
            created_at: now,
            access_seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key.clone(), entry);

        if self.entries.len() > self.config.max_entries {
            self.evict_over_capacity(Some(&key));
        }
        self.persist(Some(&key));
    }

    /// Drop every entry and the persisted snapshot.
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Err(e) = self.storage.remove_item(&self.config.namespace) {
            warn!(namespace = %self.config.namespace, error = %e, "Failed to remove cache snapshot");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            namespace: self.config.namespace.clone(),
            size: self.entries.len(),
            max_entries: self.config.max_entries,
            ttl_hours: self.config.ttl.map(|ttl| ttl.num_hours()),
            eviction_fraction: self.config.eviction_fraction,
            emergency_fraction: self.config.emergency_fraction,
            oldest_access: self
                .entries
                .values()
                .min_by_key(|e| (e.last_accessed_at, e.access_seq))
                .map(|e| e.last_accessed_at),
            persist_failures: self.persist_failures,
        }
    }

    /// Drop the oldest `emergency_fraction` of entries, never `keep`.
    /// Returns how many were removed.
    fn emergency_cleanup(&mut self, keep: Option<&K>) -> usize {
        let count = fraction_of(self.entries.len(), self.config.emergency_fraction);
        self.remove_oldest(count, keep)
    }

    fn evict_over_capacity(&mut self, keep: Option<&K>) {
        let size = self.entries.len();
        let count = fraction_of(size, self.config.eviction_fraction)
            .max(size.saturating_sub(self.config.max_entries));
        let evicted = self.remove_oldest(count, keep);
        debug!(
            namespace = %self.config.namespace,
            evicted = evicted,
            remaining = self.entries.len(),
            "Evicted least recently used entries"
        );
    }

    fn remove_oldest(&mut self, count: usize, keep: Option<&K>) -> usize {
        if count == 0 {
            return 0;
        }

        let mut by_recency: Vec<(DateTime<Utc>, u64, K)> = self
            .entries
            .iter()
            .filter(|(k, _)| keep != Some(*k))
            .map(|(k, e)| (e.last_accessed_at, e.access_seq, k.clone()))
            .collect();
        by_recency.sort_by_key(|(at, seq, _)| (*at, *seq));

        let mut removed = 0;
        for (_, _, key) in by_recency.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn write_snapshot(&self) -> StorageResult<()> {
        let contents = serde_json::to_string(&self.entries)?;
        self.storage.set_item(&self.config.namespace, &contents)
    }

    /// Persist after a read. Only recency changed, so a failure costs
    /// nothing but ordering after a reload.
    fn persist_recency(&mut self) {
        match self.write_snapshot() {
            Ok(()) => self.memory_only = false,
            Err(e) => debug!(
                namespace = %self.config.namespace,
                error = %e,
                "Failed to persist access times"
            ),
        }
    }

    /// Persist after a mutation. `keep` survives emergency cleanup.
    fn persist(&mut self, keep: Option<&K>) {
        let Err(e) = self.write_snapshot() else {
            self.memory_only = false;
            return;
        };

        if self.memory_only {
            debug!(namespace = %self.config.namespace, error = %e, "Storage still unavailable");
            return;
        }

        let removed = self.emergency_cleanup(keep);
        warn!(
            namespace = %self.config.namespace,
            error = %e,
            removed = removed,
            "Failed to persist cache, dropped oldest entries"
        );

        match self.write_snapshot() {
            Ok(()) => {}
            Err(retry_err) => {
                self.persist_failures += 1;
                self.memory_only = true;
                error!(
                    namespace = %self.config.namespace,
                    error = %retry_err,
                    "Failed to persist cache after cleanup, continuing in memory"
                );
            }
        }
    }
}

/// `ceil(size * fraction)`
fn fraction_of(size: usize, fraction: f64) -> usize {
    ((size as f64) * fraction).ceil() as usize
}
