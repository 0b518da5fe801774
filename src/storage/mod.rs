//! Durable segment storage for SaleStream
//!
//! This module provides the append-only segment log, the on-disk segment
//! encoding, and the storage backends that hold committed segments.

pub mod codec;
pub mod fs;
pub mod log;

pub use codec::{decode_segment, encode_segment, SegmentHeader};
pub use fs::FsSegmentStore;
pub use log::{DurableLog, LogStats};

use async_trait::async_trait;
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem or object store IO failure
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend temporarily unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Stored bytes failed checksum or structural validation
    #[error("Segment {segment_id} is corrupt: {reason}")]
    Corrupt { segment_id: u64, reason: String },

    /// A different segment is already stored under this id
    #[error("Segment {0} already exists with different contents")]
    Conflict(u64),

    /// Serialization/deserialization error
    #[error("Segment serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Unavailable(_))
    }
}

/// Convert storage errors to application errors
impl From<StorageError> for crate::error::Error {
    fn from(err: StorageError) -> Self {
        crate::error::Error::io(err.to_string())
    }
}

/// Outcome of a put-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

/// Append-only object store holding one immutable blob per segment id
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Store `bytes` under `segment_id` unless something is already there.
    /// Must be atomic: readers see either nothing or the full blob.
    async fn put_if_absent(&self, segment_id: u64, bytes: &[u8]) -> StorageResult<PutOutcome>;

    /// Fetch a stored segment
    async fn get(&self, segment_id: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Ids of stored segments `>= from_segment_id`, ascending
    async fn list(&self, from_segment_id: u64) -> StorageResult<Vec<u64>>;

    /// Health check for the backend
    async fn health_check(&self) -> StorageResult<()>;
}
