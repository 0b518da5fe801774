//! On-disk segment encoding
//!
//! A segment blob is one JSON header line followed by the records as JSON
//! lines. The header checksum is the SHA-256 of the record bytes exactly as
//! written, so corruption is caught without re-serializing anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{StorageError, StorageResult};
use crate::models::{IngestRecord, Segment};

pub const FORMAT_VERSION: u32 = 1;

/// Header line of an encoded segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub format_version: u32,
    pub segment_id: u64,
    pub flush_timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub min_event_time: Option<DateTime<Utc>>,
    pub max_event_time: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the record payload
    pub checksum: String,
}

fn compute_checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Encode a segment into its stored form
pub fn encode_segment(segment: &Segment) -> StorageResult<(SegmentHeader, Vec<u8>)> {
    let mut payload = Vec::new();
    for record in segment.records() {
        serde_json::to_writer(&mut payload, record)?;
        payload.push(b'\n');
    }

    let range = segment.event_time_range();
    let header = SegmentHeader {
        format_version: FORMAT_VERSION,
        segment_id: segment.segment_id,
        flush_timestamp: segment.flush_timestamp,
        record_count: segment.len(),
        first_sequence: segment.first_sequence(),
        last_sequence: segment.last_sequence(),
        min_event_time: range.map(|(lo, _)| lo),
        max_event_time: range.map(|(_, hi)| hi),
        checksum: compute_checksum(&payload),
    };

    let mut bytes = serde_json::to_vec(&header)?;
    bytes.push(b'\n');
    bytes.extend_from_slice(&payload);
    Ok((header, bytes))
}

fn split_header(bytes: &[u8]) -> StorageResult<(SegmentHeader, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n').ok_or(StorageError::Corrupt {
        segment_id: 0,
        reason: "missing header line".to_string(),
    })?;
    let header: SegmentHeader = serde_json::from_slice(&bytes[..newline])?;
    if header.format_version != FORMAT_VERSION {
        return Err(StorageError::Corrupt {
            segment_id: header.segment_id,
            reason: format!("unsupported format version {}", header.format_version),
        });
    }
    Ok((header, &bytes[newline + 1..]))
}

/// Read only the header of an encoded segment
pub fn decode_header(bytes: &[u8]) -> StorageResult<SegmentHeader> {
    split_header(bytes).map(|(header, _)| header)
}

/// Decode and verify a stored segment
pub fn decode_segment(bytes: &[u8]) -> StorageResult<Segment> {
    let (header, payload) = split_header(bytes)?;
    let corrupt = |reason: String| StorageError::Corrupt {
        segment_id: header.segment_id,
        reason,
    };

    let actual = compute_checksum(payload);
    if actual != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch (expected {}, found {})",
            header.checksum, actual
        )));
    }

    let records = payload
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(serde_json::from_slice::<IngestRecord>)
        .collect::<Result<Vec<_>, _>>()?;

    if records.len() != header.record_count {
        return Err(corrupt(format!(
            "header declares {} records, payload has {}",
            header.record_count,
            records.len()
        )));
    }
    if !records.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id) {
        return Err(corrupt("records out of sequence order".to_string()));
    }

    Ok(Segment::new(header.segment_id, header.flush_timestamp, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SaleBuilder;

    fn segment(segment_id: u64, count: u64) -> Segment {
        let records = (1..=count)
            .map(|i| IngestRecord {
                sequence_id: i,
                ingest_timestamp: Utc::now(),
                event: SaleBuilder::new().build().normalize(Utc::now()).unwrap(),
            })
            .collect();
        Segment::new(segment_id, Utc::now(), records)
    }

    #[test]
    fn test_header_describes_segment() {
        let (header, bytes) = encode_segment(&segment(3, 4)).unwrap();
        assert_eq!(header.segment_id, 3);
        assert_eq!(header.record_count, 4);
        assert_eq!(header.first_sequence, Some(1));
        assert_eq!(header.last_sequence, Some(4));
        assert_eq!(header.checksum.len(), 64);
        assert_eq!(decode_header(&bytes).unwrap(), header);
    }

    #[test]
    fn test_decode_preserves_records() {
        let original = segment(5, 3);
        let (_, bytes) = encode_segment(&original).unwrap();
        let decoded = decode_segment(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_flipped_payload_byte_is_detected() {
        let (_, mut bytes) = encode_segment(&segment(2, 2)).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x01;
        match decode_segment(&bytes) {
            Err(StorageError::Corrupt { segment_id, reason }) => {
                assert_eq!(segment_id, 2);
                assert!(reason.contains("checksum"));
            },
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let (_, bytes) = encode_segment(&segment(2, 2)).unwrap();
        assert!(decode_segment(&bytes[..bytes.len() / 2]).is_err());
        assert!(decode_segment(b"no header here").is_err());
    }
}
