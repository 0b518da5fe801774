//! In-memory write buffer bounded by size and age
//!
//! Appends and drains share one short mutex. A drained segment stays in
//! flight until its commit is acknowledged, and its records keep counting
//! against the hard limit so a stalled log turns into backpressure.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::BufferConfig;
use crate::models::{IngestRecord, SaleEvent, Segment};

/// Append refused because buffered plus in-flight records hit the hard limit
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("buffer full: {pending} pending records, limit {limit}")]
pub struct BufferFull {
    pub pending: usize,
    pub limit: usize,
}

impl From<BufferFull> for crate::error::Error {
    fn from(_: BufferFull) -> Self {
        crate::error::Error::Backpressure
    }
}

#[derive(Debug)]
struct Pending {
    arrived: Instant,
    record: IngestRecord,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    segment_id: u64,
    len: usize,
}

#[derive(Debug)]
struct BufferState {
    pending: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    next_sequence: u64,
    next_segment_id: u64,
}

/// Point-in-time view of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub buffered: usize,
    pub in_flight: usize,
    pub next_sequence: u64,
    pub next_segment_id: u64,
}

/// Size and age bounded ingest buffer
#[derive(Debug)]
pub struct EventBuffer {
    max_records: usize,
    max_age: Duration,
    hard_limit: usize,
    state: Mutex<BufferState>,
}

impl EventBuffer {
    /// Create an empty buffer whose first record gets sequence 1 and first
    /// drain gets segment 1
    pub fn new(config: &BufferConfig) -> Self {
        Self::resume(config, 1, 1)
    }

    /// Create an empty buffer that continues existing counters
    pub fn resume(config: &BufferConfig, next_sequence: u64, next_segment_id: u64) -> Self {
        Self {
            max_records: config.max_records.max(1),
            max_age: config.max_age(),
            hard_limit: config.hard_limit().max(1),
            state: Mutex::new(BufferState {
                pending: VecDeque::with_capacity(config.max_records),
                in_flight: None,
                next_sequence,
                next_segment_id,
            }),
        }
    }

    /// Append an event, returning its sequence id
    pub fn append(&self, event: SaleEvent, ingest_timestamp: DateTime<Utc>) -> Result<u64, BufferFull> {
        self.append_at(event, ingest_timestamp, Instant::now())
    }

    /// Append with an explicit arrival instant
    ///
    /// Refused once buffered plus in-flight records reach the hard limit,
    /// whether or not a drain is outstanding.
    pub fn append_at(
        &self,
        event: SaleEvent,
        ingest_timestamp: DateTime<Utc>,
        now: Instant,
    ) -> Result<u64, BufferFull> {
        let mut state = self.state.lock();

        let pending = state.pending.len() + state.in_flight.map_or(0, |f| f.len);
        if pending >= self.hard_limit {
            return Err(BufferFull {
                pending,
                limit: self.hard_limit,
            });
        }

        let sequence_id = state.next_sequence;
        state.next_sequence += 1;
        state.pending.push_back(Pending {
            arrived: now,
            record: IngestRecord {
                sequence_id,
                ingest_timestamp,
                event,
            },
        });

        Ok(sequence_id)
    }

    /// Whether a drain would produce a segment right now
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        self.ready(&state, Instant::now())
    }

    fn ready(&self, state: &BufferState, now: Instant) -> bool {
        if state.in_flight.is_some() {
            return false;
        }
        match state.pending.front() {
            None => false,
            Some(oldest) => {
                state.pending.len() >= self.max_records
                    || now.saturating_duration_since(oldest.arrived) >= self.max_age
            },
        }
    }

    /// Drain up to `max_records` records if the size or age bound is reached
    pub fn drain_if_ready(&self) -> Option<Segment> {
        self.drain_if_ready_at(Instant::now())
    }

    /// Drain with an explicit clock reading
    pub fn drain_if_ready_at(&self, now: Instant) -> Option<Segment> {
        let mut state = self.state.lock();
        if !self.ready(&state, now) {
            return None;
        }
        let take = state.pending.len().min(self.max_records);
        Some(Self::take_segment(&mut state, take))
    }

    /// Drain every buffered record regardless of readiness
    ///
    /// Returns `None` when empty or while another drain is still in flight.
    pub fn drain_all(&self) -> Option<Segment> {
        let mut state = self.state.lock();
        if state.in_flight.is_some() || state.pending.is_empty() {
            return None;
        }
        let take = state.pending.len();
        Some(Self::take_segment(&mut state, take))
    }

    fn take_segment(state: &mut BufferState, take: usize) -> Segment {
        let records: Vec<IngestRecord> = state.pending.drain(..take).map(|p| p.record).collect();
        let segment_id = state.next_segment_id;
        state.next_segment_id += 1;
        state.in_flight = Some(InFlight {
            segment_id,
            len: records.len(),
        });
        Segment::new(segment_id, Utc::now(), records)
    }

    /// Acknowledge that the in-flight segment was committed
    ///
    /// Returns false if `segment_id` is not the segment in flight.
    pub fn complete_drain(&self, segment_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.in_flight {
            Some(f) if f.segment_id == segment_id => {
                state.in_flight = None;
                true
            },
            _ => false,
        }
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            buffered: state.pending.len(),
            in_flight: state.in_flight.map_or(0, |f| f.len),
            next_sequence: state.next_sequence,
            next_segment_id: state.next_segment_id,
        }
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }
}
