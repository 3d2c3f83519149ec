//! LRU + TTL cache of resolved tiers with request coalescing.
//!
//! All state lives behind one `parking_lot::Mutex`. Critical sections never
//! await and never perform I/O: resolutions run outside the lock and publish
//! through a per-key `watch` channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tiergate_core::config::Config;
use tiergate_core::TierDetectionResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::clock::Clock;

/// Cache slot identity: one user, one resolution source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: String,
    pub source: String,
}

impl CacheKey {
    pub const RESOLVER: &'static str = "resolver";

    pub fn new(user_id: &str, source: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            source: source.to_string(),
        }
    }

    /// The slot holding the full resolver-chain answer for a user.
    pub fn resolver(user_id: &str) -> Self {
        Self::new(user_id, Self::RESOLVER)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub degraded_ttl: Duration,
    pub max_entries: usize,
    pub max_bytes: usize,
    /// Zero disables the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            degraded_ttl: Duration::from_secs(15),
            max_entries: 10_000,
            max_bytes: 16 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for CacheConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_ttl: config.cache_ttl(),
            degraded_ttl: config.cache_degraded_ttl(),
            max_entries: config.cache_max_entries,
            max_bytes: config.cache_max_bytes,
            sweep_interval: Duration::from_secs(config.cache_sweep_interval_secs),
        }
    }
}

/// Failure of a coalesced resolution, shared by the leader and every waiter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("tier resolution failed: {0}")]
    Resolution(String),

    #[error("tier cache is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub coalesced_waits: u64,
    pub stale_writes_discarded: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub average_access_time_nanos: u64,
    pub current_byte_size: usize,
    pub entry_count: usize,
    pub in_flight: usize,
}

struct CacheEntry {
    value: Arc<TierDetectionResult>,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    estimated_bytes: usize,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

type Published = Option<Result<Arc<TierDetectionResult>, CacheError>>;

struct InFlight {
    id: u64,
    tx: watch::Sender<Published>,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
    coalesced_waits: u64,
    stale_writes_discarded: u64,
    total_requests: u64,
    access_nanos: u128,
}

struct State {
    entries: LruCache<CacheKey, CacheEntry>,
    bytes: usize,
    in_flight: HashMap<CacheKey, InFlight>,
    next_flight_id: u64,
    /// Bumped by every `invalidate`.
    invalidation_seq: u64,
    /// Running leaders, including ones detached by `invalidate`.
    leaders: usize,
    /// Sequence of the most recent invalidation per user. Only consulted by
    /// running leaders, so it is cleared whenever none are left.
    user_generations: HashMap<String, u64>,
    counters: Counters,
    shut_down: bool,
}

impl State {
    fn remove_entry(&mut self, key: &CacheKey) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes = self.bytes.saturating_sub(entry.estimated_bytes);
                true
            }
            None => false,
        }
    }

    /// Fresh value for `key`, updating recency. Deletes an expired entry.
    fn lookup(&mut self, key: &CacheKey, now: Instant) -> Option<Arc<TierDetectionResult>> {
        match self.entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = now;
                entry.access_count += 1;
                return Some(Arc::clone(&entry.value));
            }
            Some(_) => {}
        }
        self.remove_entry(key);
        self.counters.expirations += 1;
        None
    }

    fn insert(
        &mut self,
        key: CacheKey,
        value: Arc<TierDetectionResult>,
        ttl: Duration,
        now: Instant,
    ) {
        let estimated_bytes = value.estimated_size() + key.user_id.len() + key.source.len();
        let entry = CacheEntry {
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            estimated_bytes,
            ttl,
        };
        if let Some((_, replaced)) = self.entries.push(key, entry) {
            self.bytes = self.bytes.saturating_sub(replaced.estimated_bytes);
        }
        self.bytes += estimated_bytes;
    }

    fn evict_to_fit(&mut self, max_entries: usize, max_bytes: usize, now: Instant) {
        while self.entries.len() > max_entries || self.bytes > max_bytes {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(entry.estimated_bytes);
            self.counters.evictions += 1;
            debug!(
                user_id = %key.user_id,
                source = %key.source,
                access_count = entry.access_count,
                idle_ms = now.saturating_duration_since(entry.last_accessed_at).as_millis() as u64,
                "Evicted tier cache entry"
            );
        }
    }

    /// Retire leader `id`. Returns whether it still owned `key`, i.e. no
    /// invalidation detached it.
    fn release_flight(&mut self, key: &CacheKey, id: u64) -> bool {
        self.leaders = self.leaders.saturating_sub(1);
        let owned = self.in_flight.get(key).is_some_and(|f| f.id == id);
        if owned {
            self.in_flight.remove(key);
        }
        if self.leaders == 0 {
            self.user_generations.clear();
        }
        owned
    }
}

/// Leader-side handle for one in-flight resolution. Dropping it without
/// calling [`FlightGuard::publish`] releases the key so waiters retry.
struct FlightGuard<'a> {
    cache: &'a TierCache,
    key: CacheKey,
    id: u64,
    started_seq: u64,
    tx: Option<watch::Sender<Published>>,
}

impl FlightGuard<'_> {
    fn publish(
        mut self,
        result: Result<TierDetectionResult, CacheError>,
    ) -> Result<Arc<TierDetectionResult>, CacheError> {
        let published = result.map(Arc::new);
        {
            let mut state = self.cache.state.lock();
            let invalidated_since = state
                .user_generations
                .get(&self.key.user_id)
                .is_some_and(|seq| *seq > self.started_seq);
            let owned = state.release_flight(&self.key, self.id);
            if let Ok(value) = &published {
                if invalidated_since || !owned || state.shut_down {
                    state.counters.stale_writes_discarded += 1;
                    debug!(
                        user_id = %self.key.user_id,
                        source = %self.key.source,
                        "Invalidation raced an in-flight resolution; discarding write"
                    );
                } else {
                    let now = self.cache.clock.now();
                    let ttl = self.cache.ttl_for(value);
                    state.insert(self.key.clone(), Arc::clone(value), ttl, now);
                    state.evict_to_fit(
                        self.cache.config.max_entries,
                        self.cache.config.max_bytes,
                        now,
                    );
                }
            }
        }
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(published.clone()));
        }
        published
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let mut state = self.cache.state.lock();
            state.release_flight(&self.key, self.id);
            debug!(user_id = %self.key.user_id, "In-flight tier resolution cancelled");
        }
    }
}

enum Role {
    Hit(Arc<TierDetectionResult>),
    Waiter(watch::Receiver<Published>),
    Leader {
        id: u64,
        started_seq: u64,
        tx: watch::Sender<Published>,
    },
}

pub struct TierCache {
    state: Mutex<State>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
}

impl TierCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                bytes: 0,
                in_flight: HashMap::new(),
                next_flight_id: 0,
                leaders: 0,
                invalidation_seq: 0,
                user_generations: HashMap::new(),
                counters: Counters::default(),
                shut_down: false,
            }),
            config,
            clock,
            shutdown_tx,
        }
    }

    fn ttl_for(&self, value: &TierDetectionResult) -> Duration {
        if value.is_degraded() {
            self.config.degraded_ttl.min(self.config.default_ttl)
        } else {
            self.config.default_ttl
        }
    }

    fn record_access(state: &mut State, started: std::time::Instant) {
        state.counters.total_requests += 1;
        state.counters.access_nanos += started.elapsed().as_nanos();
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<TierDetectionResult>> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let mut state = self.state.lock();
        let found = state.lookup(key, now);
        if found.is_some() {
            state.counters.hits += 1;
        } else {
            state.counters.misses += 1;
        }
        Self::record_access(&mut state, started);
        found
    }

    /// Insert or replace. `ttl` defaults to the configured TTL, or the
    /// degraded TTL for fallback results.
    pub fn set(&self, key: CacheKey, value: Arc<TierDetectionResult>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(&value));
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.insert(key, value, ttl, now);
        state.evict_to_fit(self.config.max_entries, self.config.max_bytes, now);
    }

    /// Return the cached value for `key` or run `resolve` to produce it.
    ///
    /// Concurrent callers for the same key share a single `resolve` call.
    /// Errors reach every waiter and are not cached. If the leading caller is
    /// cancelled, a waiter takes over and resolves again.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        key: CacheKey,
        resolve: F,
    ) -> Result<Arc<TierDetectionResult>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<TierDetectionResult>>,
    {
        let mut resolve = Some(resolve);
        let mut first_attempt = true;
        loop {
            let role = self.claim(&key, first_attempt)?;
            first_attempt = false;

            match role {
                Role::Hit(value) => return Ok(value),
                Role::Waiter(mut rx) => {
                    let published = match rx.wait_for(Option::is_some).await {
                        Ok(seen) => (*seen).clone(),
                        Err(_) => None,
                    };
                    match published {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                Role::Leader { id, started_seq, tx } => {
                    let guard = FlightGuard {
                        cache: self,
                        key: key.clone(),
                        id,
                        started_seq,
                        tx: Some(tx),
                    };
                    let Some(resolve) = resolve.take() else {
                        return Err(CacheError::Resolution("resolver already consumed".to_string()));
                    };
                    let result = resolve()
                        .await
                        .map_err(|e| CacheError::Resolution(format!("{e:#}")));
                    return guard.publish(result);
                }
            }
        }
    }

    fn claim(&self, key: &CacheKey, count_request: bool) -> Result<Role, CacheError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(CacheError::ShutDown);
        }

        let role = if let Some(value) = state.lookup(key, now) {
            if count_request {
                state.counters.hits += 1;
            }
            Role::Hit(value)
        } else if let Some(flight) = state.in_flight.get(key) {
            let rx = flight.tx.subscribe();
            state.counters.coalesced_waits += 1;
            if count_request {
                state.counters.misses += 1;
            }
            Role::Waiter(rx)
        } else {
            let (tx, _) = watch::channel(None);
            state.next_flight_id += 1;
            state.leaders += 1;
            let id = state.next_flight_id;
            let started_seq = state.invalidation_seq;
            state.in_flight.insert(
                key.clone(),
                InFlight {
                    id,
                    tx: tx.clone(),
                },
            );
            if count_request {
                state.counters.misses += 1;
            }
            Role::Leader { id, started_seq, tx }
        };
        if count_request {
            Self::record_access(&mut state, started);
        }
        Ok(role)
    }

    /// Drop every entry for `user_id` and detach its in-flight resolutions;
    /// their results still reach current waiters but are never stored.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, user_id: &str) -> usize {
        let mut state = self.state.lock();
        state.invalidation_seq += 1;
        let seq = state.invalidation_seq;

        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.user_id == user_id)
            .map(|(k, _)| k.clone())
            .collect();
        let removed = keys.iter().filter(|k| state.remove_entry(k)).count();

        state.in_flight.retain(|k, _| k.user_id != user_id);
        if state.leaders == 0 {
            state.user_generations.clear();
        } else {
            state.user_generations.insert(user_id.to_string(), seq);
        }
        state.counters.invalidations += removed as u64;
        debug!(user_id, removed, "Invalidated tier cache entries");
        removed
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove_entry(key);
        }
        state.counters.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn get_stats(&self) -> CacheStats {
        let state = self.state.lock();
        let c = &state.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            expirations: c.expirations,
            invalidations: c.invalidations,
            coalesced_waits: c.coalesced_waits,
            stale_writes_discarded: c.stale_writes_discarded,
            total_requests: c.total_requests,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
            average_access_time_nanos: if c.total_requests == 0 {
                0
            } else {
                (c.access_nanos / u128::from(c.total_requests)) as u64
            },
            current_byte_size: state.bytes,
            entry_count: state.entries.len(),
            in_flight: state.in_flight.len(),
        }
    }

    /// Background loop: purge expired entries on a fixed interval until
    /// [`TierCache::shutdown`] is called. Returns `None` when the sweep
    /// interval is zero.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval;
        if interval.is_zero() {
            return None;
        }
        let cache = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Swept expired tier cache entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }))
    }

    /// Stop the sweeper and drop all state. Later calls to
    /// `get_or_resolve` fail with [`CacheError::ShutDown`].
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.entries.clear();
            state.bytes = 0;
            state.in_flight.clear();
            state.user_generations.clear();
        }
        let _ = self.shutdown_tx.send(true);
        info!("Tier cache shut down");
    }
}
