//! SaleStream Library
//!
//! Sale event ingestion into a durable segment log, with cached aggregate
//! analytics over the committed data. The modules are exposed for the binary,
//! for integration tests and for embedding the pipeline elsewhere.

pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineStats, Recovery};

pub use analytics::{AnalyticsGateway, QueryKind, QueryableStore, TimeWindow};
pub use ingest::{Accepted, EventBuffer, IngestGateway};
pub use models::{Location, RawSaleEvent, SaleEvent, Segment};
pub use storage::{DurableLog, FsSegmentStore, SegmentStore};

// Re-export API server functions
pub use api::server::{create_router, create_server, shutdown_signal};

// Re-export health check types
pub use api::{BuildInfo, ComponentHealth, HealthResponse, HealthState, HealthStatus, ReadyResponse};
