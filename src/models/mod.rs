//! Data models for SaleStream
//!
//! This module contains the domain models used throughout the pipeline:
//! sale events, ingest records, segments and their validation logic.

pub mod error;
pub mod event;
pub mod segment;
pub mod validation;

// Re-export commonly used types
pub use error::{ValidationError, ValidationErrorKind, ValidationErrors};
pub use event::{IngestRecord, Location, RawSaleEvent, SaleEvent};
pub use segment::Segment;
pub use validation::format_cents;

#[cfg(test)]
pub use event::SaleBuilder;
