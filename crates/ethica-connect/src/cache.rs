//! TTL cache of canonical record batches, keyed by query signature.
//!
//! Entries are immutable once stored; `put` swaps a whole `Arc` in under a
//! short write lock, so readers see either the previous batch or the new one
//! and never a partially written batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::record::CanonicalRecord;

#[derive(Debug)]
pub struct CacheEntry<R> {
    pub key: String,
    pub payload: Arc<Vec<R>>,
    pub fetched_at: DateTime<Utc>,
    stored_at: Instant,
}

impl<R> CacheEntry<R> {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn is_valid(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Scope of an invalidation request.
#[derive(Debug, Clone, Copy)]
pub enum Invalidation<'a> {
    Key(&'a str),
    Prefix(&'a str),
    /// Every indexed entry that contains the record with this id.
    Record(&'a str),
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    inserts: AtomicU64,
    invalidated: AtomicU64,
    swept: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an entry past its TTL (also counted as misses).
    pub expired: u64,
    pub inserts: u64,
    pub invalidated: u64,
    pub swept: u64,
}

struct CacheInner<R> {
    entries: HashMap<String, Arc<CacheEntry<R>>>,
    /// record id -> keys of indexed entries containing it
    by_record: HashMap<String, HashSet<String>>,
}

impl<R> Default for CacheInner<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_record: HashMap::new(),
        }
    }
}

impl<R: CanonicalRecord> CacheInner<R> {
    fn unindex(&mut self, entry: &CacheEntry<R>) {
        for record in entry.payload.iter() {
            if let Some(keys) = self.by_record.get_mut(record.id()) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    self.by_record.remove(record.id());
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.unindex(&entry);
                true
            }
            None => false,
        }
    }
}

pub struct CacheManager<R> {
    ttl: Duration,
    inner: RwLock<CacheInner<R>>,
    stats: CacheCounters,
}

impl<R: CanonicalRecord> CacheManager<R> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.max(Duration::from_millis(1)),
            inner: RwLock::new(CacheInner::default()),
            stats: CacheCounters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Valid entry for `key`, or `None`. Never touches the network.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<R>>> {
        let entry = self.inner.read().entries.get(key).cloned();
        match entry {
            Some(entry) if entry.is_valid(self.ttl) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Entry for `key` regardless of age; callers must check `is_valid`.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry<R>>> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Store a batch and index its record ids for record-scoped invalidation.
    pub fn put(&self, key: &str, payload: Vec<R>) -> Arc<CacheEntry<R>> {
        self.insert(key, payload, true)
    }

    /// Store a batch without record indexing. Record-scoped invalidation
    /// will not evict it; only key, prefix and sweep do.
    pub fn put_unindexed(&self, key: &str, payload: Vec<R>) -> Arc<CacheEntry<R>> {
        self.insert(key, payload, false)
    }

    fn insert(&self, key: &str, payload: Vec<R>, indexed: bool) -> Arc<CacheEntry<R>> {
        let entry = Arc::new(CacheEntry {
            key: key.to_string(),
            payload: Arc::new(payload),
            fetched_at: Utc::now(),
            stored_at: Instant::now(),
        });
        let mut inner = self.inner.write();
        inner.remove(key);
        if indexed {
            for record in entry.payload.iter() {
                inner
                    .by_record
                    .entry(record.id().to_string())
                    .or_default()
                    .insert(key.to_string());
            }
        }
        inner.entries.insert(key.to_string(), Arc::clone(&entry));
        drop(inner);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Remove matching entries; returns how many were dropped.
    pub fn invalidate(&self, scope: Invalidation<'_>) -> usize {
        let mut inner = self.inner.write();
        let removed = match scope {
            Invalidation::Key(key) => usize::from(inner.remove(key)),
            Invalidation::Prefix(prefix) => {
                let keys: Vec<String> = inner
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                keys.iter().filter(|k| inner.remove(k)).count()
            }
            Invalidation::Record(id) => {
                let keys: Vec<String> = inner
                    .by_record
                    .get(id)
                    .map(|keys| keys.iter().cloned().collect())
                    .unwrap_or_default();
                keys.iter().filter(|k| inner.remove(k)).count()
            }
        };
        drop(inner);
        self.stats
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict every entry older than the TTL; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid(self.ttl))
            .map(|(key, _)| key.clone())
            .collect();
        let evicted = expired.iter().filter(|k| inner.remove(k)).count();
        drop(inner);
        if evicted > 0 {
            tracing::debug!(target: "ethica::cache", evicted, "swept expired entries");
        }
        self.stats.swept.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_record.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            invalidated: self.stats.invalidated.load(Ordering::Relaxed),
            swept: self.stats.swept.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{Employee, Employees};
    use crate::record::Domain;
    use serde_json::json;

    fn emp(id: &str) -> Employee {
        Employees::transform(&json!({"id": id})).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_at_ttl() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.put("k", vec![emp("1")]);
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").is_none(), "age == ttl is no longer valid");
        assert!(cache.peek("k").is_some(), "expired entries stay until swept");

        assert_eq!(cache.sweep(), 1);
        assert!(cache.peek("k").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.swept, 1);
    }

    #[tokio::test]
    async fn record_invalidation_only_touches_indexed_entries() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.put("hris:query:a", vec![emp("1"), emp("2")]);
        cache.put("hris:query:b", vec![emp("3")]);
        cache.put_unindexed("hris:snapshot", vec![emp("1"), emp("2"), emp("3")]);

        assert_eq!(cache.invalidate(Invalidation::Record("2")), 1);
        assert!(cache.peek("hris:query:a").is_none());
        assert!(cache.peek("hris:query:b").is_some());
        assert!(cache.peek("hris:snapshot").is_some());

        assert_eq!(cache.invalidate(Invalidation::Record("2")), 0);
        assert_eq!(cache.invalidate(Invalidation::Prefix("hris:query:")), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn replacing_a_key_reindexes_records() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.put("k", vec![emp("1")]);
        cache.put("k", vec![emp("2")]);
        assert_eq!(cache.invalidate(Invalidation::Record("1")), 0);
        assert_eq!(cache.invalidate(Invalidation::Record("2")), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_swaps() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.put("k", vec![emp("old")]);
        let before = cache.get("k").unwrap();
        cache.put("k", vec![emp("new-1"), emp("new-2")]);
        assert_eq!(before.payload.len(), 1);
        assert_eq!(before.payload[0].id, "old");
        assert_eq!(cache.get("k").unwrap().payload.len(), 2);
    }
}
