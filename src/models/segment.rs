//! Immutable batches of ingest records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::IngestRecord;

/// Ordered, immutable batch of records committed together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: u64,
    pub flush_timestamp: DateTime<Utc>,
    records: Vec<IngestRecord>,
}

impl Segment {
    /// Build a segment; records must already be in sequence order
    pub fn new(segment_id: u64, flush_timestamp: DateTime<Utc>, records: Vec<IngestRecord>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
        Self {
            segment_id,
            flush_timestamp,
            records,
        }
    }

    pub fn records(&self) -> &[IngestRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.records.first().map(|r| r.sequence_id)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence_id)
    }

    /// Earliest and latest event time in the segment
    ///
    /// Events arrive out of order, so this scans every record.
    pub fn event_time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut times = self.records.iter().map(IngestRecord::event_time);
        let first = times.next()?;
        Some(times.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }
}
