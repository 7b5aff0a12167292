//! A size-bounded in-memory cache with LRU eviction and per-entry TTL.
//!
//! Each instance is independent and named, so one process can run a
//! search-fallback cache, an answer cache and rate-limit counters side by
//! side with different capacities and lifetimes. All operations take a
//! single mutex and never perform I/O.
//!
//! ```
//! use std::time::Duration;
//! use protocol_retrieval::bounded_cache::BoundedCache;
//!
//! let cache = BoundedCache::new("answers", 2, Some(Duration::from_secs(60)));
//! cache.set("a", 1);
//! cache.set("b", 2);
//! assert_eq!(cache.get("a"), Some(1)); // touch "a"
//! cache.set("c", 3); // evicts "b", the least recently used
//! assert!(!cache.has("b"));
//! assert_eq!(cache.len(), 2);
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::CacheSettings;

/// `tokio::time::interval` rejects a zero period.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    Lru,
    Manual,
}

pub type EvictionListener<V> =
    Box<dyn Fn(&str, &V, EvictionReason) + Send + Sync>;

pub type Weigher<V> = Box<dyn Fn(&V) -> usize + Send + Sync>;

/// A stored value with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// `None` means the entry never expires.
    pub expires_at: Option<Instant>,
    pub created_at: Instant,
    /// Last read or write; drives LRU order.
    pub accessed_at: Instant,
    recency: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub approx_bytes: usize,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Recency counter -> key, oldest first.
    order: BTreeMap<u64, String>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.recency);
        Some(entry)
    }

    fn touch(&mut self, key: &str, now: Instant) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.recency);
            entry.recency = tick;
            entry.accessed_at = now;
            self.order.insert(tick, key.to_string());
        }
    }

    fn pop_lru(&mut self) -> Option<(String, CacheEntry<V>)> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry))
    }
}

pub struct BoundedCache<V> {
    name: String,
    max_entries: usize,
    default_ttl: Option<Duration>,
    state: Mutex<CacheState<V>>,
    on_evict: Option<EvictionListener<V>>,
    weigher: Option<Weigher<V>>,
}

impl<V> std::fmt::Debug for BoundedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> BoundedCache<V> {
    /// Creates an empty cache. A `max_entries` of zero is treated as one.
    pub fn new(
        name: impl Into<String>,
        max_entries: usize,
        default_ttl: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            max_entries: max_entries.max(1),
            default_ttl,
            state: Mutex::new(CacheState::new()),
            on_evict: None,
            weigher: None,
        }
    }

    pub fn from_settings(
        name: impl Into<String>,
        settings: &CacheSettings,
    ) -> Self {
        Self::new(name, settings.max_entries, settings.ttl())
    }

    /// Register a callback invoked for every removed entry. It runs after
    /// the cache lock is released, so it may call back into the cache.
    pub fn with_eviction_listener(
        mut self,
        listener: impl Fn(&str, &V, EvictionReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_evict = Some(Box::new(listener));
        self
    }

    /// Estimate the heap size of a value for [`CacheStats::approx_bytes`].
    pub fn with_weigher(
        mut self,
        weigher: impl Fn(&V) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.weigher = Some(Box::new(weigher));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, removed: Vec<(String, V, EvictionReason)>) {
        if let Some(listener) = &self.on_evict {
            for (key, value, reason) in &removed {
                listener(key, value, *reason);
            }
        }
    }

    /// Look up a live entry and mark it most recently used. Expired
    /// entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.misses += 1;
            state.evictions += 1;
            let removed = state.remove(key);
            drop(state);
            if let Some(entry) = removed {
                self.notify(vec![(
                    key.to_string(),
                    entry.value,
                    EvictionReason::Expired,
                )]);
            }
            return None;
        }

        state.hits += 1;
        state.touch(key, now);
        state.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert with the cache's default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.insert(key.into(), value, self.default_ttl);
    }

    /// Insert with an explicit TTL overriding the default.
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) {
        self.insert(key.into(), value, Some(ttl));
    }

    fn insert(&self, key: String, value: V, ttl: Option<Duration>) {
        let mut state = self.lock();
        let removed = self.insert_locked(&mut state, key, value, ttl);
        drop(state);
        self.notify(removed);
    }

    /// Store `value` under an already held guard and return the entries
    /// evicted to make room. Callers notify after releasing the lock.
    fn insert_locked(
        &self,
        state: &mut CacheState<V>,
        key: String,
        value: V,
        ttl: Option<Duration>,
    ) -> Vec<(String, V, EvictionReason)> {
        let now = Instant::now();
        let mut removed = Vec::new();

        // At capacity the least recently used entry goes first, even when
        // `key` is already present.
        if state.entries.len() >= self.max_entries {
            if let Some((lru_key, entry)) = state.pop_lru() {
                state.evictions += 1;
                trace!(cache = %self.name, key = %lru_key, "lru eviction");
                removed.push((lru_key, entry.value, EvictionReason::Lru));
            }
        }

        if let Some(stale) = state.remove(&key) {
            if stale.is_expired(now) {
                state.evictions += 1;
                let reason = EvictionReason::Expired;
                removed.push((key.clone(), stale.value, reason));
            }
        }
        let recency = state.next_tick();
        state.order.insert(recency, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
                created_at: now,
                accessed_at: now,
                recency,
            },
        );

        removed
    }

    /// Apply `f` to a live entry in place, keeping its expiry, or insert
    /// `initial` with the default TTL. Returns the resulting value. The
    /// check and the write happen under one lock, so concurrent callers
    /// on a fresh key never both insert `initial`.
    pub fn upsert(&self, key: &str, initial: V, f: impl FnOnce(&mut V)) -> V {
        let now = Instant::now();
        let mut state = self.lock();

        let live = state
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now));
        if live {
            state.touch(key, now);
            if let Some(entry) = state.entries.get_mut(key) {
                f(&mut entry.value);
                return entry.value.clone();
            }
        }

        let removed = self.insert_locked(
            &mut state,
            key.to_string(),
            initial.clone(),
            self.default_ttl,
        );
        drop(state);
        self.notify(removed);
        initial
    }

    /// Whether a live entry exists. Does not change recency or hit
    /// counters, but an expired entry is removed.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            None => return false,
            Some(entry) => entry.is_expired(now),
        };
        if !expired {
            return true;
        }

        state.evictions += 1;
        let removed = state.remove(key);
        drop(state);
        if let Some(entry) = removed {
            self.notify(vec![(
                key.to_string(),
                entry.value,
                EvictionReason::Expired,
            )]);
        }
        false
    }

    /// Remove an entry, reporting it with [`EvictionReason::Manual`].
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(entry) => {
                self.notify(vec![(
                    key.to_string(),
                    entry.value,
                    EvictionReason::Manual,
                )]);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and reset counters. The eviction listener is not
    /// called.
    pub fn clear(&self) {
        let mut state = self.lock();
        *state = CacheState::new();
    }

    /// Live keys, least recently used first.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.lock();
        state
            .order
            .values()
            .filter(|key| {
                state
                    .entries
                    .get(key.as_str())
                    .is_some_and(|e| !e.is_expired(now))
            })
            .cloned()
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = state.remove(&key) {
                removed.push((key, entry.value, EvictionReason::Expired));
            }
        }
        state.evictions += removed.len() as u64;
        drop(state);

        let count = removed.len();
        self.notify(removed);
        count
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let entry_overhead = std::mem::size_of::<CacheEntry<V>>();
        let approx_bytes = state
            .entries
            .iter()
            .map(|(key, entry)| {
                let value_bytes = match &self.weigher {
                    Some(weigh) => weigh(&entry.value),
                    None => 0,
                };
                // The key is stored twice: map key and recency index.
                key.len() * 2 + entry_overhead + value_bytes
            })
            .sum();

        CacheStats {
            name: self.name.clone(),
            entries: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            approx_bytes,
        }
    }
}

impl<V: Clone + Send + 'static> BoundedCache<V> {
    /// Start a background task that purges expired entries every `every`.
    ///
    /// The task holds only a weak reference: it stops on its own once the
    /// cache is dropped, and dropping the returned handle aborts it. Must
    /// be called from within a Tokio runtime. Periods below
    /// [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweepHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let name = self.name.clone();
        let every = every.max(MIN_SWEEP_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(cache = %name, removed, "swept expired entries");
                }
            }
        });

        SweepHandle { handle }
    }
}

/// Owns a background sweep task; dropping it stops the task.
#[derive(Debug)]
pub struct SweepHandle {
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
