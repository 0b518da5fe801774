//! Ingestion path: gateway, write buffer and background flusher

pub mod buffer;
pub mod flusher;
pub mod gateway;

pub use buffer::{BufferFull, BufferStats, EventBuffer};
pub use flusher::Flusher;
pub use gateway::{Accepted, IngestGateway};
