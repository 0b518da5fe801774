//! Sale event data models for SaleStream
//!
//! This module defines the raw event accepted over HTTP, the validated
//! `SaleEvent`, and the `IngestRecord` that the buffer owns until flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::Validate;

use super::error::{ValidationError, ValidationErrorKind, ValidationErrors};
use super::validation::{
    format_cents, validate_identifier, validate_location, validate_price, validate_required,
    validate_timestamp_field,
};

/// Regions a sale may be recorded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Location {
    Ca,
    Ny,
    Tx,
    Fl,
    Wa,
    Il,
    Ma,
    Ga,
    Nc,
    Oh,
}

impl Location {
    /// Every known region
    pub const ALL: [Location; 10] = [
        Location::Ca,
        Location::Ny,
        Location::Tx,
        Location::Fl,
        Location::Wa,
        Location::Il,
        Location::Ma,
        Location::Ga,
        Location::Nc,
        Location::Oh,
    ];

    /// Convert to the two-letter region code
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Ca => "CA",
            Location::Ny => "NY",
            Location::Tx => "TX",
            Location::Fl => "FL",
            Location::Wa => "WA",
            Location::Il => "IL",
            Location::Ma => "MA",
            Location::Ga => "GA",
            Location::Nc => "NC",
            Location::Oh => "OH",
        }
    }

    /// Codes of every known region
    pub fn known_codes() -> Vec<&'static str> {
        Self::ALL.iter().map(Location::as_str).collect()
    }
}

impl FromStr for Location {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|loc| loc.as_str() == code)
            .ok_or_else(|| {
                ValidationError::with_context(
                    ValidationErrorKind::UnknownLocation,
                    "location",
                    format!("Unknown location: {}", s),
                )
            })
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sale event as received from a producer
///
/// Every field is optional so that a missing field is reported as a
/// validation error rather than a body parse failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct RawSaleEvent {
    #[validate(length(min = 1, max = 64))]
    pub product_id: Option<String>,

    #[validate(length(min = 1, max = 64))]
    pub category: Option<String>,

    /// Price in currency units, two decimal places
    pub price: Option<f64>,

    pub location: Option<String>,

    #[validate(length(min = 1, max = 64))]
    pub customer_id: Option<String>,

    /// Observation time; ingest time is used when absent
    pub timestamp: Option<String>,
}

impl RawSaleEvent {
    /// Validate and normalize into a `SaleEvent`
    ///
    /// `ingest_time` becomes the event timestamp when the producer did not
    /// send one.
    pub fn normalize(self, ingest_time: DateTime<Utc>) -> Result<SaleEvent, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(length_errors) = self.validate() {
            for (field, _) in length_errors.field_errors() {
                errors.add(ValidationError::new(
                    ValidationErrorKind::InvalidLength,
                    field.to_string(),
                ));
            }
        }

        let product_id = validate_identifier(self.product_id.as_deref(), "product_id")
            .map_err(|e| errors.add(e))
            .ok();
        let category = validate_required(self.category.as_deref(), "category")
            .map(str::to_string)
            .map_err(|e| errors.add(e))
            .ok();
        let price_cents = validate_price(self.price, "price").map_err(|e| errors.add(e)).ok();
        let location = validate_location(self.location.as_deref(), "location")
            .map_err(|e| errors.add(e))
            .ok();
        let customer_id = validate_identifier(self.customer_id.as_deref(), "customer_id")
            .map_err(|e| errors.add(e))
            .ok();
        let timestamp = match self.timestamp.as_deref() {
            Some(ts) => validate_timestamp_field(ts, "timestamp").map_err(|e| errors.add(e)).ok(),
            None => Some(ingest_time),
        };

        match (product_id, category, price_cents, location, customer_id, timestamp) {
            (
                Some(product_id),
                Some(category),
                Some(price_cents),
                Some(location),
                Some(customer_id),
                Some(timestamp),
            ) if errors.is_empty() => Ok(SaleEvent {
                product_id,
                category,
                price_cents,
                location,
                customer_id,
                timestamp,
            }),
            _ => Err(errors),
        }
    }
}

/// Validated sale event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleEvent {
    pub product_id: String,
    pub category: String,
    /// Price in integer cents
    pub price_cents: i64,
    pub location: Location,
    pub customer_id: String,
    /// When the sale was observed, not when it was ingested
    pub timestamp: DateTime<Utc>,
}

impl SaleEvent {
    /// Price as an exact decimal string
    pub fn price_display(&self) -> String {
        format_cents(self.price_cents)
    }
}

/// Sale event stamped at ingest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRecord {
    /// Strictly increasing across the lifetime of the log
    pub sequence_id: u64,
    pub ingest_timestamp: DateTime<Utc>,
    pub event: SaleEvent,
}

impl IngestRecord {
    /// Event observation time
    pub fn event_time(&self) -> DateTime<Utc> {
        self.event.timestamp
    }
}

/// Builder for creating test events
#[cfg(test)]
pub struct SaleBuilder {
    raw: RawSaleEvent,
}

#[cfg(test)]
impl SaleBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawSaleEvent {
                product_id: Some("P001".to_string()),
                category: Some("Electronics".to_string()),
                price: Some(49.99),
                location: Some("CA".to_string()),
                customer_id: Some("C0001".to_string()),
                timestamp: Some("2024-03-01T12:00:00Z".to_string()),
            },
        }
    }

    pub fn product(mut self, product_id: &str) -> Self {
        self.raw.product_id = Some(product_id.to_string());
        self
    }

    pub fn price(mut self, price: Option<f64>) -> Self {
        self.raw.price = price;
        self
    }

    pub fn location(mut self, location: &str) -> Self {
        self.raw.location = Some(location.to_string());
        self
    }

    pub fn timestamp(mut self, timestamp: Option<&str>) -> Self {
        self.raw.timestamp = timestamp.map(str::to_string);
        self
    }

    pub fn category(mut self, category: Option<&str>) -> Self {
        self.raw.category = category.map(str::to_string);
        self
    }

    pub fn build(self) -> RawSaleEvent {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_from_str() {
        assert_eq!("CA".parse::<Location>().unwrap(), Location::Ca);
        assert_eq!("oh".parse::<Location>().unwrap(), Location::Oh);
        assert_eq!(" tx ".parse::<Location>().unwrap(), Location::Tx);
        assert!("XX".parse::<Location>().is_err());
        assert_eq!(Location::known_codes().len(), 10);
    }

    #[test]
    fn test_location_serde_uses_codes() {
        let json = serde_json::to_string(&Location::Nc).unwrap();
        assert_eq!(json, "\"NC\"");
        let back: Location = serde_json::from_str("\"GA\"").unwrap();
        assert_eq!(back, Location::Ga);
    }

    #[test]
    fn test_normalize_valid_event() {
        let event = SaleBuilder::new().build().normalize(Utc::now()).unwrap();
        assert_eq!(event.product_id, "P001");
        assert_eq!(event.price_cents, 4999);
        assert_eq!(event.price_display(), "49.99");
        assert_eq!(event.location, Location::Ca);
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_missing_timestamp_uses_ingest_time() {
        let now = Utc::now();
        let event = SaleBuilder::new().timestamp(None).build().normalize(now).unwrap();
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn test_missing_price_is_rejected() {
        let errors = SaleBuilder::new().price(None).build().normalize(Utc::now()).unwrap_err();
        assert!(errors.has_field("price"));
        assert_eq!(errors.errors()[0].kind, ValidationErrorKind::RequiredField);
    }

    #[test]
    fn test_all_errors_are_collected() {
        let errors = SaleBuilder::new()
            .price(Some(-1.0))
            .location("ZZ")
            .category(None)
            .build()
            .normalize(Utc::now())
            .unwrap_err();
        assert!(errors.has_field("price"));
        assert!(errors.has_field("location"));
        assert!(errors.has_field("category"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_overlong_category_is_rejected() {
        let long = "x".repeat(65);
        let errors = SaleBuilder::new()
            .category(Some(&long))
            .build()
            .normalize(Utc::now())
            .unwrap_err();
        assert!(errors
            .errors()
            .iter()
            .any(|e| e.field == "category" && e.kind == ValidationErrorKind::InvalidLength));
    }

    #[test]
    fn test_raw_event_from_producer_json() {
        let json = r#"{
            "product_id": "P003",
            "category": "Clothing",
            "price": 123.45,
            "location": "TX",
            "customer_id": "C0077",
            "timestamp": "2024-05-04T08:15:30.123456"
        }"#;
        let raw: RawSaleEvent = serde_json::from_str(json).unwrap();
        let event = raw.normalize(Utc::now()).unwrap();
        assert_eq!(event.price_cents, 12345);
        assert_eq!(event.location, Location::Tx);
    }

    #[test]
    fn test_ingest_record_serialization() {
        let event = SaleBuilder::new().build().normalize(Utc::now()).unwrap();
        let record = IngestRecord {
            sequence_id: 7,
            ingest_timestamp: Utc::now(),
            event: event.clone(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sequence_id\":7"));
        assert!(json.contains("\"location\":\"CA\""));

        let back: IngestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, event);
        assert_eq!(back.event_time(), event.timestamp);
    }
}
