//! Analytics query serving
//!
//! Aggregate queries are answered from a single-flight TTL cache in front of
//! an external queryable store. Committed segments invalidate the cached
//! windows they touch.

pub mod cache;
pub mod gateway;
pub mod kind;
pub mod store;

pub use cache::{CacheKey, CacheStats, QueryCache, SharedRows};
pub use gateway::{AnalyticsGateway, QueryResult};
pub use kind::{AggregateQuery, QueryKind, TimeWindow};
pub use store::{InMemorySalesStore, QueryableStore, Row, StoreError, StoreResult};
