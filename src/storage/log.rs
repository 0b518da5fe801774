//! Durable segment log
//!
//! Commits sealed segments to a [`SegmentStore`] with bounded retries and
//! replays them in id order after a restart. A commit that exhausts its
//! retries pauses the log; further commits are refused until an operator
//! calls [`DurableLog::resume`].

use backoff::ExponentialBackoff;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::codec::{decode_header, decode_segment, encode_segment, SegmentHeader};
use super::{PutOutcome, SegmentStore, StorageError, StorageResult};
use crate::config::SegmentLogConfig;
use crate::error::{Error, Result};
use crate::models::Segment;

/// Snapshot of log counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub committed_segments: u64,
    pub last_committed_segment: Option<u64>,
    pub commit_failures: u64,
    pub paused: bool,
}

/// Append-only log of committed segments
pub struct DurableLog {
    store: Arc<dyn SegmentStore>,
    max_attempts: u32,
    retry_base: Duration,
    retry_max: Duration,
    paused: AtomicBool,
    committed_segments: AtomicU64,
    // 0 means nothing committed yet; segment ids start at 1
    last_committed: AtomicU64,
    commit_failures: AtomicU64,
}

impl DurableLog {
    pub fn new(store: Arc<dyn SegmentStore>, config: &SegmentLogConfig) -> Self {
        Self {
            store,
            max_attempts: config.commit_max_attempts.max(1),
            retry_base: config.retry_base_delay(),
            retry_max: config.retry_max_delay(),
            paused: AtomicBool::new(false),
            committed_segments: AtomicU64::new(0),
            last_committed: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
        }
    }

    /// Durably store a segment.
    ///
    /// Idempotent per segment id: re-committing identical contents succeeds,
    /// while different contents under an existing id is a conflict.
    pub async fn commit(&self, segment: &Segment) -> Result<()> {
        if self.is_paused() {
            return Err(Error::IngestionPaused);
        }

        let (header, bytes) = encode_segment(segment).map_err(Error::from)?;

        match self.put_with_retry(&header, &bytes).await {
            Ok(outcome) => {
                self.committed_segments.fetch_add(1, Ordering::Relaxed);
                self.last_committed
                    .fetch_max(segment.segment_id, Ordering::Relaxed);
                info!(
                    segment_id = segment.segment_id,
                    records = header.record_count,
                    first_sequence = ?header.first_sequence,
                    last_sequence = ?header.last_sequence,
                    already_stored = outcome == PutOutcome::AlreadyExists,
                    "Segment committed"
                );
                Ok(())
            },
            Err(e) => {
                self.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.paused.store(true, Ordering::SeqCst);
                error!(
                    segment_id = segment.segment_id,
                    error = %e,
                    "Segment commit failed, pausing ingestion"
                );
                Err(Error::io(format!(
                    "commit of segment {} failed: {}",
                    segment.segment_id, e
                )))
            },
        }
    }

    async fn put_with_retry(
        &self,
        header: &SegmentHeader,
        bytes: &[u8],
    ) -> StorageResult<PutOutcome> {
        let backoff = ExponentialBackoff {
            initial_interval: self.retry_base,
            max_interval: self.retry_max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let store = &self.store;
        let max_attempts = self.max_attempts;

        let operation = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match put_once(store.as_ref(), header, bytes).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) if e.is_retryable() && attempt < max_attempts => {
                        warn!(
                            segment_id = header.segment_id,
                            attempt,
                            max_attempts,
                            error = %e,
                            "Segment commit failed, will retry"
                        );
                        Err(backoff::Error::transient(e))
                    },
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        };

        backoff::future::retry(backoff, operation).await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Clear the paused state after the underlying fault is fixed
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            info!("Segment log resumed");
        }
        was_paused
    }

    /// Stream committed segments with id `>= from_segment_id`, in id order.
    ///
    /// Each segment is loaded and verified only when the stream reaches it.
    pub fn replay(&self, from_segment_id: u64) -> BoxStream<'static, Result<Segment>> {
        let store = Arc::clone(&self.store);
        let lister = Arc::clone(&self.store);

        stream::once(async move { lister.list(from_segment_id).await })
            .map_ok(|ids| stream::iter(ids.into_iter().map(Ok::<u64, StorageError>)))
            .try_flatten()
            .and_then(move |segment_id| {
                let store = Arc::clone(&store);
                async move { load_segment(store.as_ref(), segment_id).await }
            })
            .map_err(Error::from)
            .boxed()
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await.map_err(Error::from)
    }

    pub fn stats(&self) -> LogStats {
        let last = self.last_committed.load(Ordering::Relaxed);
        LogStats {
            committed_segments: self.committed_segments.load(Ordering::Relaxed),
            last_committed_segment: (last > 0).then_some(last),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            paused: self.is_paused(),
        }
    }
}

async fn put_once(
    store: &dyn SegmentStore,
    header: &SegmentHeader,
    bytes: &[u8],
) -> StorageResult<PutOutcome> {
    match store.put_if_absent(header.segment_id, bytes).await? {
        PutOutcome::Created => Ok(PutOutcome::Created),
        PutOutcome::AlreadyExists => {
            let existing = store.get(header.segment_id).await?.ok_or_else(|| {
                StorageError::Unavailable(format!(
                    "segment {} reported present but could not be read",
                    header.segment_id
                ))
            })?;
            let stored = decode_header(&existing)?;
            if stored.checksum == header.checksum {
                debug!(segment_id = header.segment_id, "Segment already stored");
                Ok(PutOutcome::AlreadyExists)
            } else {
                Err(StorageError::Conflict(header.segment_id))
            }
        },
    }
}

async fn load_segment(store: &dyn SegmentStore, segment_id: u64) -> StorageResult<Segment> {
    let bytes = store
        .get(segment_id)
        .await?
        .ok_or_else(|| StorageError::Corrupt {
            segment_id,
            reason: "listed segment is missing".to_string(),
        })?;
    let segment = decode_segment(&bytes)?;
    if segment.segment_id != segment_id {
        return Err(StorageError::Corrupt {
            segment_id,
            reason: format!("blob holds segment {}", segment.segment_id),
        });
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::models::{IngestRecord, SaleBuilder};
    use crate::test_utils::MemorySegmentStore;
    use chrono::Utc;

    fn segment(segment_id: u64, first_sequence: u64, count: u64) -> Segment {
        let records = (first_sequence..first_sequence + count)
            .map(|sequence_id| IngestRecord {
                sequence_id,
                ingest_timestamp: Utc::now(),
                event: SaleBuilder::new().build().normalize(Utc::now()).unwrap(),
            })
            .collect();
        Segment::new(segment_id, Utc::now(), records)
    }

    fn log_over(store: &MemorySegmentStore) -> DurableLog {
        let config = test_config("/unused");
        DurableLog::new(Arc::new(store.clone()), &config.log)
    }

    #[tokio::test]
    async fn test_commit_then_replay_in_order() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);

        log.commit(&segment(2, 11, 5)).await.unwrap();
        log.commit(&segment(1, 1, 10)).await.unwrap();

        let replayed: Vec<Segment> = log.replay(0).try_collect().await.unwrap();
        let ids: Vec<u64> = replayed.iter().map(|s| s.segment_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(replayed[0].len(), 10);

        let tail: Vec<Segment> = log.replay(2).try_collect().await.unwrap();
        assert_eq!(tail.len(), 1);

        let stats = log.stats();
        assert_eq!(stats.committed_segments, 2);
        assert_eq!(stats.last_committed_segment, Some(2));
        assert!(!stats.paused);
    }

    #[tokio::test]
    async fn test_recommit_same_segment_is_idempotent() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);
        let seg = segment(1, 1, 3);

        log.commit(&seg).await.unwrap();
        log.commit(&seg).await.unwrap();

        assert_eq!(store.segment_count(), 1);
        assert!(!log.is_paused());
    }

    #[tokio::test]
    async fn test_different_contents_under_same_id_conflicts() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);

        log.commit(&segment(1, 1, 3)).await.unwrap();
        let err = log.commit(&segment(1, 1, 4)).await.unwrap_err();

        assert_eq!(err.kind(), "io");
        assert!(log.is_paused());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);

        store.fail_next_puts(4);
        log.commit(&segment(1, 1, 3)).await.unwrap();

        assert_eq!(store.put_attempts(), 5);
        assert_eq!(store.segment_count(), 1);
        assert!(!log.is_paused());
    }

    #[tokio::test]
    async fn test_exhausted_retries_pause_until_resume() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);

        store.fail_next_puts(5);
        let err = log.commit(&segment(1, 1, 3)).await.unwrap_err();
        assert_eq!(err.kind(), "io");
        assert_eq!(store.put_attempts(), 5);
        assert!(log.stats().paused);
        assert_eq!(log.stats().commit_failures, 1);

        let err = log.commit(&segment(1, 1, 3)).await.unwrap_err();
        assert!(matches!(err, Error::IngestionPaused));
        assert_eq!(store.put_attempts(), 5);

        assert!(log.resume());
        log.commit(&segment(1, 1, 3)).await.unwrap();
        assert_eq!(store.segment_count(), 1);
    }

    #[tokio::test]
    async fn test_replay_reports_corrupt_segment() {
        let store = MemorySegmentStore::new();
        let log = log_over(&store);

        log.commit(&segment(1, 1, 2)).await.unwrap();
        store.corrupt(1);

        let result: Result<Vec<Segment>> = log.replay(0).try_collect().await;
        assert!(result.is_err());
    }
}
