//! Configuration module for SaleStream
//!
//! This module handles loading and validating configuration from environment
//! variables. The resulting `Config` is passed explicitly to every component
//! constructor; nothing reads the environment after startup.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::analytics::QueryKind;
use crate::error::{Error, Result};

/// Main configuration structure for SaleStream
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    /// Server configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub server: ServerConfig,

    /// Ingest buffer configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub buffer: BufferConfig,

    /// Durable segment log configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub log: SegmentLogConfig,

    /// Query cache configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub cache: CacheConfig,

    /// Feature flags
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub features: FeatureFlags,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ServerConfig {
    /// Host to bind to
    #[envconfig(from = "HOST", default = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[envconfig(from = "PORT", default = "3000")]
    pub port: u16,

    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    /// Request timeout in seconds
    #[envconfig(from = "REQUEST_TIMEOUT_SECS", default = "35")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Get the server address as a string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Ingest buffer configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct BufferConfig {
    /// Records per segment; a full buffer triggers a drain
    #[envconfig(from = "BUFFER_MAX_RECORDS", default = "500")]
    pub max_records: usize,

    /// Maximum age of the oldest unflushed record, in milliseconds
    #[envconfig(from = "BUFFER_MAX_AGE_MS", default = "5000")]
    pub max_age_ms: u64,

    /// How often the flusher checks the buffer, in milliseconds
    #[envconfig(from = "FLUSH_CHECK_INTERVAL_MS", default = "250")]
    pub flush_check_interval_ms: u64,
}

impl BufferConfig {
    /// Get the maximum record age as Duration
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// Get the flusher tick as Duration
    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    /// Buffered plus in-flight records at which appends are refused
    pub fn hard_limit(&self) -> usize {
        self.max_records.saturating_mul(2)
    }
}

/// Durable segment log configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct SegmentLogConfig {
    /// Directory holding committed segment files
    #[envconfig(from = "SEGMENT_DIR", default = "./data/segments")]
    pub segment_dir: String,

    /// Attempts per commit before ingestion is paused
    #[envconfig(from = "COMMIT_MAX_ATTEMPTS", default = "5")]
    pub commit_max_attempts: u32,

    /// Base retry delay in milliseconds
    #[envconfig(from = "COMMIT_RETRY_BASE_MS", default = "100")]
    pub commit_retry_base_ms: u64,

    /// Maximum retry delay in milliseconds
    #[envconfig(from = "COMMIT_RETRY_MAX_MS", default = "5000")]
    pub commit_retry_max_ms: u64,

    /// Replay committed segments into the query store at startup
    #[envconfig(from = "REPLAY_ON_STARTUP", default = "true")]
    pub replay_on_startup: bool,
}

impl SegmentLogConfig {
    /// Get the segment directory as a path
    pub fn segment_path(&self) -> PathBuf {
        PathBuf::from(&self.segment_dir)
    }

    /// Get base retry delay as Duration
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_base_ms)
    }

    /// Get max retry delay as Duration
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_max_ms)
    }
}

/// Query cache configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct CacheConfig {
    /// TTL for top-products results, in seconds
    #[envconfig(from = "TTL_TOP_PRODUCTS_SECS", default = "5")]
    pub ttl_top_products_secs: u64,

    /// TTL for sales-by-location results, in seconds
    #[envconfig(from = "TTL_SALES_BY_LOCATION_SECS", default = "5")]
    pub ttl_sales_by_location_secs: u64,

    /// TTL for revenue-trends results, in seconds
    #[envconfig(from = "TTL_REVENUE_TRENDS_SECS", default = "30")]
    pub ttl_revenue_trends_secs: u64,

    /// TTL for sales-by-category results, in seconds
    #[envconfig(from = "TTL_SALES_BY_CATEGORY_SECS", default = "5")]
    pub ttl_sales_by_category_secs: u64,

    /// How long a caller waits on a recomputation, in seconds
    #[envconfig(from = "QUERY_TIMEOUT_SECS", default = "30")]
    pub query_timeout_secs: u64,

    /// Global cap on simultaneous store recomputations
    #[envconfig(from = "MAX_CONCURRENT_RECOMPUTATIONS", default = "4")]
    pub max_concurrent_recomputations: usize,

    /// Stale results may be served for this many TTLs when upstream fails
    #[envconfig(from = "STALE_GRACE_FACTOR", default = "2")]
    pub stale_grace_factor: u32,

    /// How often entries past their grace period are purged, in seconds
    #[envconfig(from = "CACHE_SWEEP_INTERVAL_SECS", default = "60")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    /// TTL configured for a query kind
    pub fn ttl_for(&self, kind: QueryKind) -> Duration {
        let secs = match kind {
            QueryKind::TopProducts => self.ttl_top_products_secs,
            QueryKind::SalesByLocation => self.ttl_sales_by_location_secs,
            QueryKind::RevenueTrends => self.ttl_revenue_trends_secs,
            QueryKind::SalesByCategory => self.ttl_sales_by_category_secs,
        };
        Duration::from_secs(secs)
    }

    /// Grace period during which a stale value may back an upstream failure
    pub fn grace_for(&self, kind: QueryKind) -> Duration {
        self.ttl_for(kind) * self.stale_grace_factor
    }

    /// Get query timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_top_products_secs: 5,
            ttl_sales_by_location_secs: 5,
            ttl_revenue_trends_secs: 30,
            ttl_sales_by_category_secs: 5,
            query_timeout_secs: 30,
            max_concurrent_recomputations: 4,
            stale_grace_factor: 2,
            sweep_interval_secs: 60,
        }
    }
}

/// Feature flags
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct FeatureFlags {
    /// Expose the /metrics endpoint
    #[envconfig(from = "ENABLE_METRICS", default = "true")]
    pub metrics: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::config("Server port cannot be 0"));
        }

        if self.buffer.max_records == 0 {
            return Err(Error::config("BUFFER_MAX_RECORDS must be at least 1"));
        }

        if self.buffer.max_age_ms == 0 || self.buffer.flush_check_interval_ms == 0 {
            return Err(Error::config("Buffer age and flush interval must be positive"));
        }

        if self.log.segment_dir.trim().is_empty() {
            return Err(Error::config("SEGMENT_DIR cannot be empty"));
        }

        if self.log.commit_max_attempts == 0 {
            return Err(Error::config("COMMIT_MAX_ATTEMPTS must be at least 1"));
        }

        if self.cache.max_concurrent_recomputations == 0 {
            return Err(Error::config("MAX_CONCURRENT_RECOMPUTATIONS must be at least 1"));
        }

        if self.cache.query_timeout_secs == 0 {
            return Err(Error::config("QUERY_TIMEOUT_SECS must be positive"));
        }

        if self.cache.sweep_interval_secs == 0 {
            return Err(Error::config("CACHE_SWEEP_INTERVAL_SECS must be positive"));
        }

        Ok(())
    }

    /// Log configuration
    pub fn log_config(&self) {
        tracing::info!(
            server_address = %self.server.address(),
            environment = %self.server.environment,
            log_level = %self.server.log_level,
            "Server configuration"
        );

        tracing::info!(
            max_records = self.buffer.max_records,
            max_age_ms = self.buffer.max_age_ms,
            hard_limit = self.buffer.hard_limit(),
            "Buffer configuration"
        );

        tracing::info!(
            segment_dir = %self.log.segment_dir,
            commit_max_attempts = self.log.commit_max_attempts,
            replay_on_startup = self.log.replay_on_startup,
            "Segment log configuration"
        );

        tracing::info!(
            query_timeout_secs = self.cache.query_timeout_secs,
            max_concurrent = self.cache.max_concurrent_recomputations,
            grace_factor = self.cache.stale_grace_factor,
            "Cache configuration"
        );
    }
}
