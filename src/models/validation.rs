//! Field validation functions for sale events
//!
//! Each validator returns the parsed value on success, so the event
//! normalization can validate and convert in a single pass.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use super::error::{ValidationError, ValidationErrorKind};
use super::event::Location;

static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();

/// Largest accepted price, in cents
pub const MAX_PRICE_CENTS: i64 = 1_000_000_000;

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("Invalid identifier regex pattern")
    })
}

/// Require a present, non-blank string field
pub fn validate_required<'a>(
    value: Option<&'a str>,
    field_name: &str,
) -> Result<&'a str, ValidationError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::new(
            ValidationErrorKind::RequiredField,
            field_name,
        )),
    }
}

/// Validate a product or customer identifier
pub fn validate_identifier(value: Option<&str>, field_name: &str) -> Result<String, ValidationError> {
    let value = validate_required(value, field_name)?;
    if identifier_regex().is_match(value) {
        Ok(value.to_string())
    } else {
        Err(ValidationError::with_context(
            ValidationErrorKind::InvalidIdentifier,
            field_name,
            format!("'{}' must match [A-Za-z0-9_-]{{1,64}}", value),
        ))
    }
}

/// Validate a price and convert it to integer cents
pub fn validate_price(price: Option<f64>, field_name: &str) -> Result<i64, ValidationError> {
    let price = price.ok_or_else(|| {
        ValidationError::new(ValidationErrorKind::RequiredField, field_name)
    })?;

    if !price.is_finite() {
        return Err(ValidationError::with_context(
            ValidationErrorKind::InvalidPrice,
            field_name,
            "Price must be a finite number",
        ));
    }

    let cents = (price * 100.0).round();
    if cents < 1.0 || cents > MAX_PRICE_CENTS as f64 {
        return Err(ValidationError::with_context(
            ValidationErrorKind::InvalidPrice,
            field_name,
            format!("Price {} is outside (0, {}]", price, MAX_PRICE_CENTS / 100),
        ));
    }

    Ok(cents as i64)
}

/// Validate a location against the known regions
pub fn validate_location(value: Option<&str>, field_name: &str) -> Result<Location, ValidationError> {
    let value = validate_required(value, field_name)?;
    value.parse::<Location>().map_err(|_| {
        ValidationError::with_context(
            ValidationErrorKind::UnknownLocation,
            field_name,
            format!("'{}' is not one of {}", value, Location::known_codes().join(", ")),
        )
    })
}

/// Parse an event timestamp
///
/// Accepts RFC 3339, and naive ISO-8601 values without an offset which are
/// taken as UTC.
pub fn validate_timestamp_field(
    timestamp: &str,
    field_name: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = timestamp.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            ValidationError::with_context(
                ValidationErrorKind::InvalidTimestamp,
                field_name,
                format!("Failed to parse timestamp '{}': {}", trimmed, e),
            )
        })
}

/// Format integer cents as an exact decimal string
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
