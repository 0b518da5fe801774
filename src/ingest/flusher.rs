//! Background flush loop
//!
//! Moves sealed segments from the buffer into the durable log, makes them
//! visible to the queryable store and expires the cached windows they touch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use super::buffer::EventBuffer;
use crate::analytics::{QueryCache, QueryableStore};
use crate::error::Result;
use crate::logging::Timer;
use crate::models::Segment;
use crate::storage::DurableLog;

/// Drives drains, commits, indexing and cache invalidation
pub struct Flusher {
    buffer: Arc<EventBuffer>,
    log: Arc<DurableLog>,
    store: Arc<dyn QueryableStore>,
    cache: QueryCache,
    wakeup: Arc<Notify>,
    check_interval: Duration,
    sweep_interval: Duration,
    // Drained but not yet committed; retried before any new drain
    pending: Option<Segment>,
    // Committed but not yet accepted by the store
    unindexed: VecDeque<Arc<Segment>>,
}

impl Flusher {
    pub fn new(
        buffer: Arc<EventBuffer>,
        log: Arc<DurableLog>,
        store: Arc<dyn QueryableStore>,
        cache: QueryCache,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            buffer,
            log,
            store,
            cache,
            wakeup,
            check_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(60),
            pending: None,
            unindexed: VecDeque::new(),
        }
    }

    pub fn with_intervals(mut self, check_interval: Duration, sweep_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self.sweep_interval = sweep_interval;
        self
    }

    /// Commit at most one segment. Returns the committed segment id, or
    /// `None` when nothing was ready or the log is paused.
    pub async fn flush_once(&mut self) -> Result<Option<u64>> {
        self.index_backlog().await;

        if self.log.is_paused() {
            return Ok(None);
        }

        let segment = match self.pending.take() {
            Some(segment) => segment,
            None => match self.buffer.drain_if_ready() {
                Some(segment) => segment,
                None => return Ok(None),
            },
        };

        self.commit(segment).await.map(Some)
    }

    /// Flush until nothing is ready or a commit fails
    pub async fn flush_ready(&mut self) -> usize {
        let mut committed = 0;
        loop {
            match self.flush_once().await {
                Ok(Some(_)) => committed += 1,
                Ok(None) => break,
                Err(e) => {
                    crate::log_error!(e, "Flush round failed");
                    break;
                },
            }
        }
        committed
    }

    async fn commit(&mut self, segment: Segment) -> Result<u64> {
        let segment_id = segment.segment_id;
        let span = crate::segment_span!(segment_id);
        span.record("records", segment.len() as u64);

        async {
            let timer = Timer::start("commit_segment");
            if let Err(e) = self.log.commit(&segment).await {
                self.pending = Some(segment);
                return Err(e);
            }
            self.buffer.complete_drain(segment_id);
            timer.stop();

            self.publish(Arc::new(segment)).await;
            Ok(segment_id)
        }
        .instrument(span)
        .await
    }

    async fn publish(&mut self, segment: Arc<Segment>) {
        match self.store.index_segment(Arc::clone(&segment)).await {
            Ok(()) => self.invalidate(&segment),
            Err(e) => {
                warn!(
                    segment_id = segment.segment_id,
                    error = %e,
                    "Indexing failed, will retry"
                );
                self.unindexed.push_back(segment);
            },
        }
    }

    async fn index_backlog(&mut self) {
        while let Some(segment) = self.unindexed.pop_front() {
            if let Err(e) = self.store.index_segment(Arc::clone(&segment)).await {
                debug!(segment_id = segment.segment_id, error = %e, "Index retry failed");
                self.unindexed.push_front(segment);
                return;
            }
            self.invalidate(&segment);
        }
    }

    fn invalidate(&self, segment: &Segment) {
        if let Some((min, max)) = segment.event_time_range() {
            self.cache.invalidate_range(min, max);
        }
    }

    /// Run until `shutdown` flips to true, then flush what is left
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut check = tokio::time::interval(self.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_interval_ms = self.check_interval.as_millis() as u64,
            "Flusher started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                },
                _ = sweep.tick() => {
                    let purged = self.cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Swept expired cache entries");
                    }
                    continue;
                },
                _ = check.tick() => {},
                _ = self.wakeup.notified() => {},
            }
            self.flush_ready().await;
        }

        self.final_flush().await;
    }

    /// Commit every remaining record; best effort when the log is paused
    pub async fn final_flush(&mut self) {
        self.flush_ready().await;

        while !self.log.is_paused() {
            let segment = match self.pending.take().or_else(|| self.buffer.drain_all()) {
                Some(segment) => segment,
                None => break,
            };
            if let Err(e) = self.commit(segment).await {
                crate::log_error!(e, "Final flush failed");
                break;
            }
        }

        let stats = self.buffer.stats();
        if stats.buffered + stats.in_flight > 0 {
            warn!(
                buffered = stats.buffered,
                in_flight = stats.in_flight,
                "Shutting down with unflushed records"
            );
        } else {
            info!(next_sequence = stats.next_sequence, "Buffer fully flushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AnalyticsGateway, InMemorySalesStore, QueryKind, TimeWindow};
    use crate::config::{tests::test_config, CacheConfig};
    use crate::models::SaleBuilder;
    use crate::test_utils::MemorySegmentStore;
    use chrono::Utc;
    use futures::TryStreamExt;

    struct Harness {
        buffer: Arc<EventBuffer>,
        log: Arc<DurableLog>,
        segments: MemorySegmentStore,
        store: Arc<InMemorySalesStore>,
        analytics: AnalyticsGateway,
        flusher: Flusher,
    }

    fn harness() -> Harness {
        let config = test_config("/unused");
        let segments = MemorySegmentStore::new();
        let buffer = Arc::new(EventBuffer::new(&config.buffer));
        let log = Arc::new(DurableLog::new(Arc::new(segments.clone()), &config.log));
        let store = Arc::new(InMemorySalesStore::new());
        let analytics = AnalyticsGateway::new(store.clone(), &CacheConfig::default());
        let flusher = Flusher::new(
            Arc::clone(&buffer),
            Arc::clone(&log),
            store.clone(),
            analytics.cache().clone(),
            Arc::new(Notify::new()),
        );
        Harness {
            buffer,
            log,
            segments,
            store,
            analytics,
            flusher,
        }
    }

    fn append(buffer: &EventBuffer, n: usize) {
        for _ in 0..n {
            let event = SaleBuilder::new().build().normalize(Utc::now()).unwrap();
            buffer.append(event, Utc::now()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_buffer_is_committed_and_indexed() {
        let mut h = harness();
        append(&h.buffer, 150);

        assert_eq!(h.flusher.flush_ready().await, 1);
        assert_eq!(h.buffer.stats().buffered, 50);
        assert_eq!(h.segments.segment_count(), 1);
        assert_eq!(h.store.event_count().await, 100);
    }

    #[tokio::test]
    async fn test_commit_invalidates_cached_windows() {
        let mut h = harness();
        let before = h
            .analytics
            .query_window(QueryKind::TopProducts, TimeWindow::unbounded())
            .await
            .unwrap();
        assert!(before.rows.is_empty());

        append(&h.buffer, 100);
        h.flusher.flush_ready().await;

        let after = h
            .analytics
            .query_window(QueryKind::TopProducts, TimeWindow::unbounded())
            .await
            .unwrap();
        assert_eq!(after.rows[0]["sales_count"], serde_json::json!(100));
        assert_eq!(h.analytics.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_is_kept_and_retried_after_resume() {
        let mut h = harness();
        append(&h.buffer, 100);

        h.segments.fail_next_puts(5);
        assert!(h.flusher.flush_once().await.is_err());
        assert!(h.log.is_paused());
        assert_eq!(h.buffer.stats().in_flight, 100);

        assert_eq!(h.flusher.flush_once().await.unwrap(), None);

        h.log.resume();
        assert_eq!(h.flusher.flush_once().await.unwrap(), Some(1));
        assert_eq!(h.buffer.stats().in_flight, 0);
        assert_eq!(h.store.event_count().await, 100);
    }

    #[tokio::test]
    async fn test_final_flush_drains_partial_buffer() {
        let mut h = harness();
        append(&h.buffer, 130);

        h.flusher.final_flush().await;

        let stats = h.buffer.stats();
        assert_eq!(stats.buffered + stats.in_flight, 0);
        let segments: Vec<Segment> = h.log.replay(0).try_collect().await.unwrap();
        let sizes: Vec<usize> = segments.iter().map(Segment::len).collect();
        assert_eq!(sizes, vec![100, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_after_flushing() {
        let h = harness();
        append(&h.buffer, 10);
        let (tx, rx) = watch::channel(false);
        let buffer = Arc::clone(&h.buffer);
        let segments = h.segments.clone();

        let task = tokio::spawn(h.flusher.run(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(buffer.stats().buffered, 0);
        assert_eq!(segments.segment_count(), 1);
    }
}
