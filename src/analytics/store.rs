//! Queryable store seam
//!
//! The aggregate query engine is an external collaborator. It indexes
//! committed segments and answers the rendered aggregate queries. Any engine
//! implementing [`QueryableStore`] can back the analytics API; the crate
//! ships [`InMemorySalesStore`] as an in-process reference engine.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use super::kind::{AggregateQuery, QueryKind};
use crate::models::{format_cents, SaleEvent, Segment};

/// One result row, column name to value
pub type Row = Map<String, Value>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Query engine error types
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Engine cannot be reached
    #[error("Query engine unavailable: {0}")]
    Unavailable(String),

    /// Engine rejected or failed the query
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// No result within the deadline
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

/// Store failures surface to callers as upstream errors
impl From<StoreError> for crate::error::Error {
    fn from(err: StoreError) -> Self {
        crate::error::Error::upstream(err.to_string())
    }
}

#[async_trait]
pub trait QueryableStore: Send + Sync {
    /// Make a committed segment visible to queries. Indexing the same
    /// segment twice must not double count it.
    async fn index_segment(&self, segment: Arc<Segment>) -> StoreResult<()>;

    /// Run an aggregate query; sums and counts are exact
    async fn execute(&self, query: &AggregateQuery) -> StoreResult<Vec<Row>>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// In-process reference engine over indexed segments
///
/// Holds the committed segments themselves; events are never copied out.
#[derive(Debug, Default)]
pub struct InMemorySalesStore {
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
}

impl InMemorySalesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed events
    pub async fn event_count(&self) -> usize {
        self.segments.read().await.values().map(|s| s.len()).sum()
    }

    /// Number of indexed segments
    pub async fn segment_count(&self) -> usize {
        self.segments.read().await.len()
    }
}

fn count_by<'a>(
    events: impl Iterator<Item = &'a SaleEvent>,
    key_column: &str,
    key: impl Fn(&SaleEvent) -> String,
    limit: usize,
) -> Vec<Row> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for event in events {
        *counts.entry(key(event)).or_default() += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    ranked
        .into_iter()
        .take(limit)
        .map(|(value, count)| {
            let mut row = Row::new();
            row.insert(key_column.to_string(), json!(value));
            row.insert("sales_count".to_string(), json!(count));
            row
        })
        .collect()
}

fn revenue_by_day<'a>(events: impl Iterator<Item = &'a SaleEvent>, limit: usize) -> Vec<Row> {
    let mut days: BTreeMap<String, i64> = BTreeMap::new();
    for event in events {
        let day = event.timestamp.format("%Y-%m-%d").to_string();
        *days.entry(day).or_default() += event.price_cents;
    }

    days.into_iter()
        .rev()
        .take(limit)
        .map(|(date, cents)| {
            let mut row = Row::new();
            row.insert("date".to_string(), json!(date));
            row.insert("total_revenue".to_string(), json!(format_cents(cents)));
            row
        })
        .collect()
}

#[async_trait]
impl QueryableStore for InMemorySalesStore {
    async fn index_segment(&self, segment: Arc<Segment>) -> StoreResult<()> {
        let mut segments = self.segments.write().await;
        if segments.contains_key(&segment.segment_id) {
            tracing::debug!(segment_id = segment.segment_id, "Segment already indexed");
            return Ok(());
        }
        segments.insert(segment.segment_id, segment);
        Ok(())
    }

    async fn execute(&self, query: &AggregateQuery) -> StoreResult<Vec<Row>> {
        let segments = self.segments.read().await;
        let window = query.window;
        let matching = segments
            .values()
            .flat_map(|segment| segment.records())
            .map(|record| &record.event)
            .filter(|e| window.contains(e.timestamp));
        let limit = query.kind.limit();

        let rows = match query.kind {
            QueryKind::TopProducts => {
                count_by(matching, "product_id", |e| e.product_id.clone(), limit)
            },
            QueryKind::SalesByLocation => {
                count_by(matching, "location", |e| e.location.to_string(), limit)
            },
            QueryKind::SalesByCategory => {
                count_by(matching, "category", |e| e.category.clone(), limit)
            },
            QueryKind::RevenueTrends => revenue_by_day(matching, limit),
        };
        Ok(rows)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
