//! Ingest front door
//!
//! Validates and timestamps raw sale events, then appends them to the
//! buffer. A full buffer surfaces as backpressure; nothing is dropped.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::buffer::EventBuffer;
use crate::error::{Error, Result};
use crate::models::RawSaleEvent;

/// Receipt for an accepted event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub record_id: Uuid,
    pub sequence_id: u64,
}

/// Validates incoming events and feeds the buffer
#[derive(Clone)]
pub struct IngestGateway {
    buffer: Arc<EventBuffer>,
    flush_wakeup: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl IngestGateway {
    pub fn new(buffer: Arc<EventBuffer>, flush_wakeup: Arc<Notify>) -> Self {
        Self {
            buffer,
            flush_wakeup,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Validate, stamp and buffer one event
    pub fn submit(&self, raw: RawSaleEvent) -> Result<Accepted> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let ingest_time = Utc::now();
        let event = raw.normalize(ingest_time)?;
        let product_id = event.product_id.clone();

        let sequence_id = self.buffer.append(event, ingest_time).map_err(|full| {
            warn!(pending = full.pending, limit = full.limit, "Ingest buffer full");
            Error::from(full)
        })?;

        if self.buffer.is_ready() {
            self.flush_wakeup.notify_one();
        }

        debug!(sequence_id, product_id = %product_id, "Event buffered");
        Ok(Accepted {
            record_id: Uuid::new_v4(),
            sequence_id,
        })
    }

    /// Refuse further events; used once shutdown begins
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::models::SaleBuilder;

    fn gateway(max_records: usize) -> (IngestGateway, Arc<EventBuffer>, Arc<Notify>) {
        let buffer = Arc::new(EventBuffer::new(&BufferConfig {
            max_records,
            max_age_ms: 60_000,
            flush_check_interval_ms: 50,
        }));
        let wakeup = Arc::new(Notify::new());
        (
            IngestGateway::new(Arc::clone(&buffer), Arc::clone(&wakeup)),
            buffer,
            wakeup,
        )
    }

    #[test]
    fn test_missing_price_is_invalid_and_not_buffered() {
        let (gateway, buffer, _) = gateway(10);
        gateway.submit(SaleBuilder::new().build()).unwrap();
        let before = buffer.stats();

        let err = gateway
            .submit(SaleBuilder::new().price(None).build())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert_eq!(buffer.stats(), before);

        let next = gateway.submit(SaleBuilder::new().build()).unwrap();
        assert_eq!(next.sequence_id, 2);
    }

    #[test]
    fn test_unknown_location_is_invalid() {
        let (gateway, buffer, _) = gateway(10);
        let err = gateway
            .submit(SaleBuilder::new().location("ZZ").build())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert_eq!(buffer.stats().buffered, 0);
    }

    #[test]
    fn test_full_buffer_is_backpressure() {
        let (gateway, buffer, _) = gateway(2);
        for _ in 0..4 {
            gateway.submit(SaleBuilder::new().build()).unwrap();
        }
        let err = gateway.submit(SaleBuilder::new().build()).unwrap_err();
        assert_eq!(err.kind(), "backpressure");
        assert_eq!(buffer.stats().buffered, 4);
    }

    #[tokio::test]
    async fn test_ready_buffer_wakes_flusher() {
        let (gateway, _, wakeup) = gateway(2);
        gateway.submit(SaleBuilder::new().build()).unwrap();
        gateway.submit(SaleBuilder::new().build()).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), wakeup.notified())
            .await
            .expect("flusher should have been woken");
    }

    #[test]
    fn test_closed_gateway_refuses_events() {
        let (gateway, _, _) = gateway(10);
        gateway.close();
        assert!(gateway.is_closed());
        let err = gateway.submit(SaleBuilder::new().build()).unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
