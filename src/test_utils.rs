//! Test utilities for SaleStream
//!
//! This module provides in-memory collaborators with failure injection and
//! sample event helpers for unit and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analytics::{AggregateQuery, QueryableStore, Row, StoreError, StoreResult};
use crate::models::{RawSaleEvent, Segment};
use crate::storage::{PutOutcome, SegmentStore, StorageError, StorageResult};

/// In-memory segment store with injectable put failures
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentStore {
    blobs: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
    fail_puts: Arc<AtomicU32>,
    put_attempts: Arc<AtomicUsize>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a transient IO error
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Total puts attempted, including failed ones
    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn segment_count(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Flip the last byte of a stored segment's payload
    pub fn corrupt(&self, segment_id: u64) {
        if let Some(blob) = self.blobs.lock().get_mut(&segment_id) {
            let len = blob.len();
            if len > 2 {
                blob[len - 2] ^= 0x01;
            }
        }
    }

    fn take_failure(&self) -> bool {
        self.fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SegmentStore for MemorySegmentStore {
    async fn put_if_absent(&self, segment_id: u64, bytes: &[u8]) -> StorageResult<PutOutcome> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(StorageError::Io(std::io::Error::other("injected put failure")));
        }

        let mut blobs = self.blobs.lock();
        if blobs.contains_key(&segment_id) {
            return Ok(PutOutcome::AlreadyExists);
        }
        blobs.insert(segment_id, bytes.to_vec());
        Ok(PutOutcome::Created)
    }

    async fn get(&self, segment_id: u64) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(&segment_id).cloned())
    }

    async fn list(&self, from_segment_id: u64) -> StorageResult<Vec<u64>> {
        Ok(self.blobs.lock().range(from_segment_id..).map(|(id, _)| *id).collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Queryable store that counts executions
///
/// Each result holds one row naming the kind and the call number, so tests
/// can tell a cached result from a recomputed one.
#[derive(Debug, Clone, Default)]
pub struct MockQueryableStore {
    execute_calls: Arc<AtomicUsize>,
    indexed: Arc<Mutex<Vec<u64>>>,
    delay: Option<Duration>,
    fail_next: Arc<AtomicU32>,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
    unhealthy: Arc<Mutex<Option<String>>>,
}

impl MockQueryableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every execution by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `n` executions fail
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, reason: Option<&str>) {
        *self.unhealthy.lock() = reason.map(str::to_string);
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Most executions observed running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn indexed_segments(&self) -> Vec<u64> {
        self.indexed.lock().clone()
    }
}

#[async_trait]
impl QueryableStore for MockQueryableStore {
    async fn index_segment(&self, segment: Arc<Segment>) -> StoreResult<()> {
        let mut indexed = self.indexed.lock();
        if !indexed.contains(&segment.segment_id) {
            indexed.push(segment.segment_id);
        }
        Ok(())
    }

    async fn execute(&self, query: &AggregateQuery) -> StoreResult<Vec<Row>> {
        let call = self.execute_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected query failure".to_string()));
        }

        let mut row = Row::new();
        row.insert("kind".to_string(), json!(query.kind.as_str()));
        row.insert("call".to_string(), json!(call));
        Ok(vec![row])
    }

    async fn health_check(&self) -> StoreResult<()> {
        match self.unhealthy.lock().clone() {
            Some(reason) => Err(StoreError::Unavailable(reason)),
            None => Ok(()),
        }
    }
}

/// A valid raw sale event
pub fn sample_sale(product_id: &str, location: &str, price: f64, timestamp: &str) -> RawSaleEvent {
    RawSaleEvent {
        product_id: Some(product_id.to_string()),
        category: Some("Electronics".to_string()),
        price: Some(price),
        location: Some(location.to_string()),
        customer_id: Some("C0001".to_string()),
        timestamp: Some(timestamp.to_string()),
    }
}

/// A valid sale event body as the producer sends it
pub fn sample_sale_json() -> serde_json::Value {
    json!({
        "product_id": "P001",
        "category": "Electronics",
        "price": 49.99,
        "location": "CA",
        "customer_id": "C0001",
        "timestamp": "2024-03-01T12:00:00"
    })
}
