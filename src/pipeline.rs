//! Pipeline wiring
//!
//! Builds every component from one `Config`, recovers state from the
//! durable log, runs the flusher and coordinates shutdown.

use futures::TryStreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::{AnalyticsGateway, CacheStats, InMemorySalesStore, QueryableStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{BufferStats, EventBuffer, Flusher, IngestGateway};
use crate::logging::Timer;
use crate::storage::{DurableLog, FsSegmentStore, LogStats, SegmentStore};

/// Counters recovered from the durable log at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub segments: u64,
    pub records: u64,
    pub next_sequence: u64,
    pub next_segment_id: u64,
}

/// Snapshot of every component's counters
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    pub buffer: BufferStats,
    pub log: LogStats,
    pub cache: CacheStats,
    pub available_permits: usize,
}

/// The running ingest and analytics pipeline
pub struct Pipeline {
    config: Arc<Config>,
    buffer: Arc<EventBuffer>,
    log: Arc<DurableLog>,
    store: Arc<dyn QueryableStore>,
    ingest: IngestGateway,
    analytics: AnalyticsGateway,
    wakeup: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    recovery: Recovery,
}

impl Pipeline {
    /// Open the filesystem segment log and the in-process store named by `config`
    pub async fn open(config: Arc<Config>) -> Result<Self> {
        let segments = FsSegmentStore::open(config.log.segment_path()).await?;
        Self::build(config, Arc::new(segments), Arc::new(InMemorySalesStore::new())).await
    }

    /// Build over explicit collaborators and recover from the log
    pub async fn build(
        config: Arc<Config>,
        segments: Arc<dyn SegmentStore>,
        store: Arc<dyn QueryableStore>,
    ) -> Result<Self> {
        let log = Arc::new(DurableLog::new(segments, &config.log));
        let recovery = recover(&log, store.as_ref(), config.log.replay_on_startup).await?;

        let buffer = Arc::new(EventBuffer::resume(
            &config.buffer,
            recovery.next_sequence,
            recovery.next_segment_id,
        ));
        let wakeup = Arc::new(Notify::new());
        let ingest = IngestGateway::new(Arc::clone(&buffer), Arc::clone(&wakeup));
        let analytics = AnalyticsGateway::new(Arc::clone(&store), &config.cache);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            buffer,
            log,
            store,
            ingest,
            analytics,
            wakeup,
            shutdown_tx,
            flusher: Mutex::new(None),
            recovery,
        })
    }

    /// Spawn the background flusher. Calling it twice has no effect.
    pub fn start(&self) {
        let mut slot = self.flusher.lock();
        if slot.is_some() {
            return;
        }

        let flusher = Flusher::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.log),
            Arc::clone(&self.store),
            self.analytics.cache().clone(),
            Arc::clone(&self.wakeup),
        )
        .with_intervals(
            self.config.buffer.flush_check_interval(),
            self.config.cache.sweep_interval(),
        );
        *slot = Some(tokio::spawn(flusher.run(self.shutdown_tx.subscribe())));
    }

    /// Stop accepting events, flush what is buffered and wait for the flusher
    pub async fn shutdown(&self) -> Result<()> {
        self.ingest.close();
        self.shutdown_tx.send_replace(true);

        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            let timeout = self.config.server.shutdown_timeout();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => return Err(Error::internal(format!("flusher task failed: {}", e))),
                Err(_) => {
                    warn!(timeout_secs = timeout.as_secs(), "Flusher did not finish in time");
                },
            }
        }

        info!("Pipeline stopped");
        Ok(())
    }

    /// Operator intervention after the log paused on commit failures
    pub fn resume_ingestion(&self) -> bool {
        let resumed = self.log.resume();
        if resumed {
            self.wakeup.notify_one();
        }
        resumed
    }

    pub fn ingest(&self) -> &IngestGateway {
        &self.ingest
    }

    pub fn analytics(&self) -> &AnalyticsGateway {
        &self.analytics
    }

    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    pub fn store(&self) -> &Arc<dyn QueryableStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn recovery(&self) -> Recovery {
        self.recovery
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            buffer: self.buffer.stats(),
            log: self.log.stats(),
            cache: self.analytics.stats(),
            available_permits: self.analytics.cache().available_permits(),
        }
    }
}

/// Replay committed segments, optionally indexing them into `store`
async fn recover(log: &DurableLog, store: &dyn QueryableStore, index: bool) -> Result<Recovery> {
    let timer = Timer::start("recover");
    let mut recovery = Recovery {
        next_sequence: 1,
        next_segment_id: 1,
        ..Recovery::default()
    };

    let mut segments = log.replay(0);
    while let Some(segment) = segments.try_next().await? {
        let segment = Arc::new(segment);
        if index {
            store.index_segment(Arc::clone(&segment)).await?;
        }
        recovery.segments += 1;
        recovery.records += segment.len() as u64;
        recovery.next_segment_id = recovery.next_segment_id.max(segment.segment_id + 1);
        if let Some(last) = segment.last_sequence() {
            recovery.next_sequence = recovery.next_sequence.max(last + 1);
        }
    }

    let elapsed = timer.stop();
    info!(
        segments = recovery.segments,
        records = recovery.records,
        next_sequence = recovery.next_sequence,
        next_segment_id = recovery.next_segment_id,
        duration_ms = elapsed.as_millis() as u64,
        "Recovered from segment log"
    );
    Ok(recovery)
}
