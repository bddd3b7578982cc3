//! Payload cache with byte budget, TTL expiry and LRU eviction
//!
//! **Why**: Pages embed the same animation many times; parsing a payload once
//! and sharing it (`Arc`) across instances saves both CPU and memory.
//!
//! **Used by**: PayloadLoader (consulted before fetch), MemoryManager (cleared
//! under pressure), AnimationManager (hit rate in global stats).
//!
//! # Accounting
//!
//! Item size is the length of the item's serialized JSON form. This is an
//! estimate of the payload's footprint, not a measurement of the live object
//! graph: parsed numbers and maps usually take more memory than their text.
//!
//! # Ordering
//!
//! Entries live in an `IndexMap` whose order is recency: `set` and a hit in
//! `get` move the key to the back, eviction pops from the front. TTL is measured
//! from the last `set` of the key, reads do not extend it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::entities::Clock;

/// Cache statistics for monitoring performance
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// hits / (hits + misses), 0 before any access
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// Cached value with bookkeeping
#[derive(Debug, Clone)]
pub struct CacheItem<V> {
    pub data: Arc<V>,
    pub inserted_at: f64,
    pub byte_size: usize,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheState<V> {
    items: IndexMap<String, CacheItem<V>>,
    total_bytes: usize,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheItem<V>> {
        let item = self.items.shift_remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(item.byte_size);
        Some(item)
    }

    fn evict_oldest(&mut self) -> Option<(String, CacheItem<V>)> {
        let (key, item) = self.items.shift_remove_index(0)?;
        self.total_bytes = self.total_bytes.saturating_sub(item.byte_size);
        Some((key, item))
    }
}

/// Byte-budgeted, TTL + LRU cache of decoded payloads keyed by source identity.
pub struct CacheManager<V> {
    state: Mutex<CacheState<V>>,
    /// Byte budget
    max_size: usize,
    ttl_ms: f64,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
}

impl<V: Serialize> CacheManager<V> {
    /// Create cache with a byte budget and time-to-live
    ///
    /// # Arguments
    ///
    /// * `max_size` - Byte budget for the sum of all item sizes
    /// * `ttl_ms` - Entries older than this are treated as absent
    /// * `clock` - Time source for TTL checks
    pub fn new(max_size: usize, ttl_ms: f64, clock: Arc<dyn Clock>) -> Self {
        debug!(
            "CacheManager created: budget={} KB, ttl={} ms",
            max_size / 1024,
            ttl_ms
        );
        Self {
            state: Mutex::new(CacheState {
                items: IndexMap::new(),
                total_bytes: 0,
            }),
            max_size,
            ttl_ms,
            clock,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Estimated footprint of `data` (serialized JSON length)
    pub fn estimate_size(data: &V) -> Option<usize> {
        serde_json::to_vec(data).ok().map(|bytes| bytes.len())
    }

    /// Insert or refresh an entry.
    ///
    /// Returns false without touching the cache if the item alone exceeds the
    /// budget (or cannot be sized). Otherwise evicts least recently used
    /// entries one at a time until the item fits.
    pub fn set(&self, key: impl Into<String>, data: impl Into<Arc<V>>) -> bool {
        let key = key.into();
        let data = data.into();

        let Some(byte_size) = Self::estimate_size(&data) else {
            warn!("CacheManager: cannot estimate size of '{}', not cached", key);
            return false;
        };
        if byte_size > self.max_size {
            debug!(
                "CacheManager: '{}' too large ({} bytes > {} budget)",
                key, byte_size, self.max_size
            );
            return false;
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Drop the old slot first so a re-set is resized, not double counted
        state.remove(&key);

        while state.total_bytes + byte_size > self.max_size {
            match state.evict_oldest() {
                Some((evicted, item)) => {
                    self.stats.record_eviction();
                    debug!("CacheManager: evicted '{}' ({} bytes)", evicted, item.byte_size);
                }
                None => break,
            }
        }

        state.items.insert(
            key,
            CacheItem {
                data,
                inserted_at: now,
                byte_size,
            },
        );
        state.total_bytes += byte_size;
        true
    }
}

impl<V> CacheManager<V> {
    fn is_expired(&self, item: &CacheItem<V>, now: f64) -> bool {
        now - item.inserted_at > self.ttl_ms
    }

    /// Get entry. Unknown and expired keys count as misses; expired entries are
    /// deleted on access.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let expired = match state.items.get(key) {
            None => {
                self.stats.record_miss();
                return None;
            }
            Some(item) => self.is_expired(item, now),
        };

        if expired {
            state.remove(key);
            self.stats.record_miss();
            debug!("CacheManager: '{}' expired on access", key);
            return None;
        }

        // Move to back (most recently used)
        let item = state.items.shift_remove(key)?;
        let data = Arc::clone(&item.data);
        state.items.insert(key.to_string(), item);
        self.stats.record_hit();
        Some(data)
    }

    /// Check presence without touching recency or stats
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .items
            .get(key)
            .map(|item| !self.is_expired(item, now))
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// Drop every entry. Returns number removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let count = state.items.len();
        state.items.clear();
        state.total_bytes = 0;
        if count > 0 {
            debug!("CacheManager: cleared {} entries", count);
        }
        count
    }

    /// Sweep entries past their TTL. Returns number removed.
    ///
    /// Not scheduled internally; the owner calls it from a timer.
    pub fn clean_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = state
            .items
            .iter()
            .filter(|(_, item)| self.is_expired(item, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            debug!("CacheManager: swept {} expired entries", expired.len());
        }
        expired.len()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats.hit_rate()
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of item sizes currently held
    pub fn total_bytes(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).total_bytes
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let (entries, total_bytes) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.items.len(), state.total_bytes)
        };
        CacheSnapshot {
            entries,
            total_bytes,
            max_bytes: self.max_size,
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ManualClock;

    /// Value whose serialized size is exactly `n` bytes: a JSON string of n-2 chars
    fn blob(n: usize) -> String {
        "x".repeat(n - 2)
    }

    fn cache(max: usize, ttl: f64) -> (CacheManager<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CacheManager::new(max, ttl, clock.clone()), clock)
    }

    #[test]
    fn test_set_get_round_trip() {
        let (cache, _) = cache(1024, 1000.0);
        assert!(cache.set("a.json", blob(10)));
        assert_eq!(cache.get("a.json").as_deref(), Some(&blob(10)));
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_oversized_item_rejected_without_eviction() {
        let (cache, _) = cache(100, 1000.0);
        assert!(cache.set("a", blob(60)));
        assert!(!cache.set("huge", blob(101)));
        assert!(cache.contains("a"));
        assert_eq!(cache.total_bytes(), 60);
        assert_eq!(cache.stats().evictions(), 0);
    }

    #[test]
    fn test_lru_get_protects_entry() {
        let (cache, _) = cache(100, 1000.0);
        assert!(cache.set("A", blob(40)));
        assert!(cache.set("B", blob(40)));
        assert!(cache.get("A").is_some());

        // C forces exactly one eviction: B is least recently used
        assert!(cache.set("C", blob(40)));
        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
        assert!(cache.contains("C"));
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn test_budget_invariant_under_churn() {
        let (cache, _) = cache(500, 1000.0);
        for i in 0..100 {
            let size = 10 + (i * 37) % 120;
            cache.set(format!("k{}", i), blob(size));
            assert!(cache.total_bytes() <= 500);
        }
    }

    #[test]
    fn test_reset_resizes_slot() {
        let (cache, _) = cache(100, 1000.0);
        assert!(cache.set("a", blob(50)));
        assert!(cache.set("a", blob(20)));
        assert_eq!(cache.total_bytes(), 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hit_rate() {
        let (cache, _) = cache(100, 1000.0);
        assert_eq!(cache.hit_rate(), 0.0);

        cache.set("a", blob(10));
        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.get("missing");
        assert_eq!(cache.hit_rate(), 0.75);
    }

    #[test]
    fn test_expired_entry_deleted_on_access() {
        let (cache, clock) = cache(100, 1000.0);
        cache.set("a", blob(30));
        clock.advance(1001.0);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(cache.stats().misses(), 1);

        // Fresh set after expiry starts from clean accounting
        assert!(cache.set("a", blob(30)));
        assert_eq!(cache.total_bytes(), 30);
    }

    #[test]
    fn test_get_does_not_extend_ttl() {
        let (cache, clock) = cache(100, 1000.0);
        cache.set("a", blob(10));
        clock.advance(600.0);
        assert!(cache.get("a").is_some());
        clock.advance(600.0);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_clean_expired() {
        let (cache, clock) = cache(1000, 1000.0);
        cache.set("old1", blob(10));
        cache.set("old2", blob(10));
        clock.advance(800.0);
        cache.set("fresh", blob(10));
        clock.advance(300.0);

        assert_eq!(cache.clean_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("fresh"));
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_delete_and_clear() {
        let (cache, _) = cache(1000, 1000.0);
        cache.set("a", blob(10));
        cache.set("b", blob(10));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
