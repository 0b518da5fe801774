//! Query kinds, time windows and rendered aggregate queries

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::models::validation::validate_timestamp_field;
use crate::models::{ValidationError, ValidationErrorKind, ValidationErrors};

const WINDOW_PLACEHOLDER: &str = "{window}";

const TOP_PRODUCTS_SQL: &str = "SELECT product_id, COUNT(*) AS sales_count \
     FROM sales WHERE {window} \
     GROUP BY product_id ORDER BY sales_count DESC, product_id ASC LIMIT 5";

const SALES_BY_LOCATION_SQL: &str = "SELECT location, COUNT(*) AS sales_count \
     FROM sales WHERE {window} \
     GROUP BY location ORDER BY sales_count DESC, location ASC LIMIT 10";

const REVENUE_TRENDS_SQL: &str = "SELECT substr(timestamp, 1, 10) AS date, SUM(price) AS total_revenue \
     FROM sales WHERE {window} \
     GROUP BY substr(timestamp, 1, 10) ORDER BY date DESC LIMIT 30";

const SALES_BY_CATEGORY_SQL: &str = "SELECT category, COUNT(*) AS sales_count \
     FROM sales WHERE {window} \
     GROUP BY category ORDER BY sales_count DESC, category ASC LIMIT 10";

/// The closed set of analytics queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    TopProducts,
    SalesByLocation,
    RevenueTrends,
    SalesByCategory,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::TopProducts,
        QueryKind::SalesByLocation,
        QueryKind::RevenueTrends,
        QueryKind::SalesByCategory,
    ];

    /// Path segment naming this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::TopProducts => "top-products",
            QueryKind::SalesByLocation => "sales-by-location",
            QueryKind::RevenueTrends => "revenue-trends",
            QueryKind::SalesByCategory => "sales-by-category",
        }
    }

    /// Aggregate query template; `{window}` is replaced by the window predicate
    pub fn template(&self) -> &'static str {
        match self {
            QueryKind::TopProducts => TOP_PRODUCTS_SQL,
            QueryKind::SalesByLocation => SALES_BY_LOCATION_SQL,
            QueryKind::RevenueTrends => REVENUE_TRENDS_SQL,
            QueryKind::SalesByCategory => SALES_BY_CATEGORY_SQL,
        }
    }

    /// Maximum rows the query returns
    pub fn limit(&self) -> usize {
        match self {
            QueryKind::TopProducts => 5,
            QueryKind::SalesByLocation | QueryKind::SalesByCategory => 10,
            QueryKind::RevenueTrends => 30,
        }
    }
}

impl FromStr for QueryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open event-time window `[from, to)`; a missing bound is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from >= to {
                return Err(ValidationError::with_context(
                    ValidationErrorKind::InvalidWindow,
                    "from",
                    format!("{} is not before {}", from, to),
                ));
            }
        }
        Ok(Self { from, to })
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Parse optional `from`/`to` query parameters
    pub fn parse(from: Option<&str>, to: Option<&str>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut bound = |value: Option<&str>, field: &str| match value {
            Some(raw) if !raw.trim().is_empty() => validate_timestamp_field(raw, field)
                .map_err(|e| errors.add(e))
                .ok(),
            _ => None,
        };

        let from = bound(from, "from");
        let to = bound(to, "to");
        if !errors.is_empty() {
            return Err(errors);
        }

        Self::new(from, to).map_err(ValidationErrors::from)
    }

    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    pub fn to(&self) -> Option<DateTime<Utc>> {
        self.to
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| t >= from) && self.to.map_or(true, |to| t < to)
    }

    /// Whether any instant of the closed range `[min, max]` falls in the window
    pub fn overlaps(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| max >= from) && self.to.map_or(true, |to| min < to)
    }

    /// Window as a SQL predicate over the event `timestamp` column
    pub fn predicate(&self) -> String {
        let fmt = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        match (self.from, self.to) {
            (None, None) => "TRUE".to_string(),
            (Some(from), None) => format!("timestamp >= '{}'", fmt(from)),
            (None, Some(to)) => format!("timestamp < '{}'", fmt(to)),
            (Some(from), Some(to)) => format!(
                "timestamp >= '{}' AND timestamp < '{}'",
                fmt(from),
                fmt(to)
            ),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        write!(f, "[{}, {})", show(self.from), show(self.to))
    }
}

/// A rendered aggregate query ready for the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub kind: QueryKind,
    pub window: TimeWindow,
    pub sql: String,
}

impl AggregateQuery {
    pub fn new(kind: QueryKind, window: TimeWindow) -> Self {
        let sql = kind
            .template()
            .replace(WINDOW_PLACEHOLDER, &window.predicate());
        Self { kind, window, sql }
    }
}
