//! Aggregate result cache
//!
//! Cache-aside over the queryable store, keyed by (kind, window). A miss
//! spawns one recomputation task per key; every caller for that key awaits
//! the same shared result with a deadline. The task runs to completion even
//! if all of its callers time out, so its result still lands in the cache.
//!
//! The key map lock is held only for lookups and bookkeeping, never across an
//! await. Recomputations acquire a permit from a semaphore shared by all keys.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

use super::kind::{AggregateQuery, QueryKind, TimeWindow};
use super::store::{QueryableStore, Row, StoreError};
use crate::config::CacheConfig;
use crate::logging::Timer;

/// Result rows shared between the cache and its readers
pub type SharedRows = Arc<Vec<Row>>;

type Recomputation = Shared<BoxFuture<'static, Result<SharedRows, StoreError>>>;

/// Cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: QueryKind,
    pub window: TimeWindow,
}

/// A computed result and its freshness bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub rows: SharedRows,
    pub computed_at: Instant,
    pub ttl: Duration,
    invalidated: bool,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.computed_at)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        !self.invalidated && self.age(now) < self.ttl
    }
}

/// A last-known-good value served in place of a failed recomputation
#[derive(Debug, Clone)]
pub struct StaleRows {
    pub rows: SharedRows,
    pub age: Duration,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    inflight: Option<Recomputation>,
    // Bumped by every invalidation that touches this key
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    recomputations: AtomicU64,
    recompute_failures: AtomicU64,
    invalidations: AtomicU64,
    timeouts: AtomicU64,
    stale_served: AtomicU64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub inflight: usize,
    pub hits: u64,
    pub misses: u64,
    pub recomputations: u64,
    pub recompute_failures: u64,
    pub invalidations: u64,
    pub timeouts: u64,
    pub stale_served: u64,
}

struct CacheInner {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    store: Arc<dyn QueryableStore>,
    permits: Arc<Semaphore>,
    config: CacheConfig,
    counters: Counters,
}

/// Single-flight TTL cache for aggregate results
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(
        store: Arc<dyn QueryableStore>,
        config: CacheConfig,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                store,
                permits,
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Rows for `(kind, window)`, recomputing at most once per key at a time
    pub async fn get(&self, kind: QueryKind, window: TimeWindow) -> Result<SharedRows, StoreError> {
        let key = CacheKey { kind, window };
        let recomputation = {
            let now = Instant::now();
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key).or_default();

            if let Some(entry) = slot.entry.as_ref().filter(|e| e.is_fresh(now)) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.rows));
            }

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            match &slot.inflight {
                Some(running) => running.clone(),
                None => {
                    let running = CacheInner::spawn_recomputation(&self.inner, key, slot.generation);
                    slot.inflight = Some(running.clone());
                    running
                },
            }
        };

        let deadline = self.inner.config.query_timeout();
        match tokio::time::timeout(deadline, recomputation).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, %window, timeout_secs = deadline.as_secs(), "Query wait timed out");
                Err(StoreError::Timeout(deadline))
            },
        }
    }

    /// Expire every entry whose window could include `[min, max]`.
    ///
    /// Recomputations already running for those keys store their result
    /// pre-expired. Returns the number of entries expired.
    pub fn invalidate_range(
        &self,
        min: chrono::DateTime<chrono::Utc>,
        max: chrono::DateTime<chrono::Utc>,
    ) -> usize {
        let mut expired = 0;
        let mut slots = self.inner.slots.lock();
        for (key, slot) in slots.iter_mut() {
            if !key.window.overlaps(min, max) {
                continue;
            }
            slot.generation += 1;
            if let Some(entry) = slot.entry.as_mut() {
                if !entry.invalidated {
                    entry.invalidated = true;
                    expired += 1;
                }
            }
        }
        drop(slots);

        self.inner
            .counters
            .invalidations
            .fetch_add(expired as u64, Ordering::Relaxed);
        if expired > 0 {
            debug!(expired, %min, %max, "Invalidated cached aggregates");
        }
        expired
    }

    /// Last computed rows for a key if still inside its grace period
    pub fn last_known_good(&self, kind: QueryKind, window: TimeWindow) -> Option<StaleRows> {
        let now = Instant::now();
        let grace = self.inner.config.grace_for(kind);
        let slots = self.inner.slots.lock();
        let entry = slots.get(&CacheKey { kind, window })?.entry.as_ref()?;
        let age = entry.age(now);
        (age < grace).then(|| {
            self.inner.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            StaleRows {
                rows: Arc::clone(&entry.rows),
                age,
            }
        })
    }

    /// Drop entries past their grace period. Keys with a running
    /// recomputation are kept.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let config = &self.inner.config;
        let mut slots = self.inner.slots.lock();
        let before = slots.len();
        slots.retain(|key, slot| {
            slot.inflight.is_some()
                || slot
                    .entry
                    .as_ref()
                    .is_some_and(|e| e.age(now) < config.grace_for(key.kind))
        });
        before - slots.len()
    }

    /// Recomputation permits currently free
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, inflight) = {
            let slots = self.inner.slots.lock();
            (
                slots.values().filter(|s| s.entry.is_some()).count(),
                slots.values().filter(|s| s.inflight.is_some()).count(),
            )
        };
        let c = &self.inner.counters;
        CacheStats {
            entries,
            inflight,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            recomputations: c.recomputations.load(Ordering::Relaxed),
            recompute_failures: c.recompute_failures.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    // Caller holds the slot lock; the task cannot publish before `inflight` is set.
    fn spawn_recomputation(inner: &Arc<Self>, key: CacheKey, generation: u64) -> Recomputation {
        let task_inner = Arc::clone(inner);
        let span = crate::query_span!(key.kind, key.window);
        let task = tokio::spawn(
            async move {
                let result = task_inner.recompute(key).await;
                task_inner.publish(key, generation, &result);
                result
            }
            .instrument(span),
        );

        let join_inner = Arc::clone(inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    join_inner.abandon(key);
                    Err(StoreError::QueryFailed(format!("recomputation task failed: {}", e)))
                },
            }
        }
        .boxed()
        .shared()
    }

    async fn recompute(&self, key: CacheKey) -> Result<SharedRows, StoreError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Unavailable("recomputation permits closed".to_string()))?;

        self.counters.recomputations.fetch_add(1, Ordering::Relaxed);
        let timer = Timer::start("recompute");
        let query = AggregateQuery::new(key.kind, key.window);
        let result = self.store.execute(&query).await;
        timer.stop();

        match result {
            Ok(rows) => {
                tracing::Span::current().record("rows", rows.len() as u64);
                Ok(Arc::new(rows))
            },
            Err(e) => {
                self.counters.recompute_failures.fetch_add(1, Ordering::Relaxed);
                crate::log_error!(e, "Aggregate recomputation failed", kind = key.kind);
                Err(e)
            },
        }
    }

    fn publish(&self, key: CacheKey, generation: u64, result: &Result<SharedRows, StoreError>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key).or_default();
        slot.inflight = None;

        // A failed recomputation leaves the previous entry as last known good
        if let Ok(rows) = result {
            slot.entry = Some(CacheEntry {
                rows: Arc::clone(rows),
                computed_at: Instant::now(),
                ttl: self.config.ttl_for(key.kind),
                invalidated: slot.generation != generation,
            });
        }
    }

    fn abandon(&self, key: CacheKey) {
        if let Some(slot) = self.slots.lock().get_mut(&key) {
            slot.inflight = None;
        }
    }
}
