//! Analytics request routing
//!
//! Resolves the requested kind and window, answers from the cache and falls
//! back to the last known-good value when the store fails.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use super::cache::{CacheStats, QueryCache, SharedRows};
use super::kind::{QueryKind, TimeWindow};
use super::store::QueryableStore;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Rows answering an analytics request
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    #[serde(skip)]
    pub kind: QueryKind,
    #[serde(rename = "data")]
    pub rows: SharedRows,
    /// Served from the grace fallback after an upstream failure
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

/// Front door for analytics queries
#[derive(Clone)]
pub struct AnalyticsGateway {
    cache: QueryCache,
}

impl AnalyticsGateway {
    /// Build the gateway and its cache. At most
    /// `max_concurrent_recomputations` store queries run at once.
    pub fn new(store: Arc<dyn QueryableStore>, config: &CacheConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_recomputations));
        Self {
            cache: QueryCache::new(store, config.clone(), permits),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Answer a request given its raw path kind and `from`/`to` parameters
    pub async fn query(&self, kind: &str, from: Option<&str>, to: Option<&str>) -> Result<QueryResult> {
        let kind: QueryKind = kind.parse()?;
        let window = TimeWindow::parse(from, to)?;
        self.query_window(kind, window).await
    }

    pub async fn query_window(&self, kind: QueryKind, window: TimeWindow) -> Result<QueryResult> {
        match self.cache.get(kind, window).await {
            Ok(rows) => Ok(QueryResult {
                kind,
                rows,
                stale: false,
            }),
            Err(e) => match self.cache.last_known_good(kind, window) {
                Some(fallback) => {
                    warn!(
                        %kind,
                        %window,
                        error = %e,
                        age_ms = fallback.age.as_millis() as u64,
                        "Serving last known good result"
                    );
                    Ok(QueryResult {
                        kind,
                        rows: fallback.rows,
                        stale: true,
                    })
                },
                None => Err(Error::from(e)),
            },
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
