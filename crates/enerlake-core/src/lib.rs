//! Domain model for the building-energy lakehouse: entity payloads,
//! generated-id formats, and calendar-month arithmetic.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "enerlake-core";

/// Wire format for `received_at` timestamps, UTC second precision.
pub const RECEIVED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_received_at(ts: DateTime<Utc>) -> String {
    ts.format(RECEIVED_AT_FORMAT).to_string()
}

pub fn parse_received_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, RECEIVED_AT_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Boundary validation failure, surfaced to the caller as a 4xx message.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Closed set of fluids a delivery point can meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluidType {
    Elec,
    #[serde(rename = "gaz")]
    Gas,
    Fod,
    Heat,
    Cold,
    Wood,
}

/// Degree-day indicator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Hdd,
    Cdd,
}

impl Indicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::Hdd => "hdd",
            Indicator::Cdd => "cdd",
        }
    }
}

/// A calendar month, rendered on the wire as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        use chrono::Datelike;
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("month key is always valid")
    }

    pub fn last_day(&self) -> NaiveDate {
        let next = self.succ();
        next.first_day().pred_opt().expect("month start has a predecessor")
    }

    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    /// Every calendar month from `start` to `end` inclusive.
    pub fn range(start: NaiveDate, end: NaiveDate) -> Vec<Self> {
        let mut months = Vec::new();
        let mut current = Self::from_date(start);
        let last = Self::from_date(end);
        while current <= last {
            months.push(current);
            current = current.succ();
        }
        months
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (year, month) = raw
            .split_once('-')
            .ok_or_else(|| ValidationError::new(format!("invalid month key: {raw}")))?;
        let year: i32 = year
            .parse()
            .map_err(|_| ValidationError::new(format!("invalid month key: {raw}")))?;
        let month: u32 = month
            .parse()
            .map_err(|_| ValidationError::new(format!("invalid month key: {raw}")))?;
        Self::new(year, month).ok_or_else(|| ValidationError::new(format!("invalid month key: {raw}")))
    }
}

// ---------------------------------------------------------------------------
// Generated id formats
//
// Every primary id is derived from a max-existing-suffix scan over storage,
// never from a process-local counter. The formats are fixed-width so the
// scans can parse them back.
// ---------------------------------------------------------------------------

pub const BUILDING_ID_WIDTH: usize = 6;

pub fn format_building_id(index: u32) -> String {
    format!("building_{index:06}")
}

/// `building_000042` -> `000042`.
pub fn building_suffix(building_id: &str) -> Option<&str> {
    let suffix = building_id.strip_prefix("building_")?;
    (suffix.len() == BUILDING_ID_WIDTH && suffix.bytes().all(|b| b.is_ascii_digit()))
        .then_some(suffix)
}

pub fn format_deliverypoint_id(building_suffix: &str, index: u32) -> String {
    format!("deliverypoint_{building_suffix}_{index:03}")
}

/// `deliverypoint_000042_003` -> (`000042`, `003`).
pub fn parse_deliverypoint_id(dp_id: &str) -> Option<(&str, &str)> {
    let rest = dp_id.strip_prefix("deliverypoint_")?;
    let (building, dp) = rest.split_once('_')?;
    let ok = building.len() == BUILDING_ID_WIDTH
        && dp.len() == 3
        && building.bytes().all(|b| b.is_ascii_digit())
        && dp.bytes().all(|b| b.is_ascii_digit());
    ok.then_some((building, dp))
}

pub fn format_invoice_id(building_suffix: &str, dp_suffix: &str, index: u32) -> String {
    format!("invoice_{building_suffix}_{dp_suffix}_{index:02}")
}

pub fn format_usage_data_id(building_suffix: &str, index: u32) -> String {
    format!("usage_data_{building_suffix}_{index:03}")
}

pub fn format_season_id(index: u32) -> String {
    format!("season_{index:03}")
}

/// One-off id for an invoice batch bronze document.
pub fn new_invoice_batch_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let token = Uuid::new_v4().simple().to_string();
    format!("invoice_batch_{stamp}_{}", &token[..8])
}

/// Parses a zero-padded numeric index out of `<stem>.json` given the expected
/// prefix, e.g. (`building_`, `building_000007.json`) -> 7.
pub fn index_from_file_name(prefix: &str, file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".json")?;
    let digits = stem.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Create payloads (the validated request side of the API boundary)
// ---------------------------------------------------------------------------

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildingCreate {
    pub platform_code: String,
    pub building_code: String,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub organisation: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub typology: Option<String>,
    #[serde(default)]
    pub geographical_area: Option<i64>,
    #[serde(default)]
    pub occupant: Option<i64>,
    #[serde(default)]
    pub surface: Option<f64>,
    #[serde(default)]
    pub reference_period_start: Option<NaiveDate>,
    #[serde(default)]
    pub reference_period_end: Option<NaiveDate>,
    #[serde(default)]
    pub weather_station: Option<String>,
}

impl BuildingCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("platform_code", &self.platform_code)?;
        require_non_empty("building_code", &self.building_code)?;
        require_non_empty("name", &self.name)?;
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ValidationError::new("latitude must be within [-90, 90]"));
            }
        }
        if let Some(lon) = self.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ValidationError::new("longitude must be within [-180, 180]"));
            }
        }
        if self.occupant.is_some_and(|v| v < 0) {
            return Err(ValidationError::new("occupant must be >= 0"));
        }
        if self.surface.is_some_and(|v| v < 0.0) {
            return Err(ValidationError::new("surface must be >= 0"));
        }
        if let (Some(start), Some(end)) = (self.reference_period_start, self.reference_period_end) {
            if start > end {
                return Err(ValidationError::new(
                    "reference_period_start must be before or equal to reference_period_end",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryPointCreate {
    pub id_building_primaire: String,
    pub deliverypoint_code: String,
    pub deliverypoint_number: String,
    pub fluid: FluidType,
    pub fluid_unit: String,
}

impl DeliveryPointCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        building_suffix(&self.id_building_primaire).ok_or_else(|| {
            ValidationError::new(format!(
                "invalid id_building_primaire (expected building_{}): {}",
                "X".repeat(BUILDING_ID_WIDTH),
                self.id_building_primaire
            ))
        })?;
        require_non_empty("deliverypoint_code", &self.deliverypoint_code)?;
        require_non_empty("deliverypoint_number", &self.deliverypoint_number)?;
        require_non_empty("fluid_unit", &self.fluid_unit)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvoiceCreate {
    pub deliverypoint_id_primaire: String,
    pub invoice_code: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub value: f64,
}

impl InvoiceCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        parse_deliverypoint_id(&self.deliverypoint_id_primaire).ok_or_else(|| {
            ValidationError::new(format!(
                "invalid deliverypoint_id_primaire: {}",
                self.deliverypoint_id_primaire
            ))
        })?;
        require_non_empty("invoice_code", &self.invoice_code)?;
        if self.end < self.start {
            return Err(ValidationError::new("end must be after or equal to start"));
        }
        if self.value < 0.0 {
            return Err(ValidationError::new("value must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvoiceBatchCreate {
    pub invoices: Vec<InvoiceCreate>,
}

impl InvoiceBatchCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.invoices.is_empty() {
            return Err(ValidationError::new("invoices must not be empty"));
        }
        for invoice in &self.invoices {
            invoice.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageDataCreate {
    pub id_building_primaire: String,
    pub r#type: String,
    pub date: NaiveDate,
    pub value: f64,
}

impl UsageDataCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        building_suffix(&self.id_building_primaire).ok_or_else(|| {
            ValidationError::new(format!(
                "invalid id_building_primaire: {}",
                self.id_building_primaire
            ))
        })?;
        require_non_empty("type", &self.r#type)?;
        if self.value < 0.0 {
            return Err(ValidationError::new("value must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeasonCreate {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl SeasonCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        if self.start_date > self.end_date {
            return Err(ValidationError::new(
                "start_date must be before or equal to end_date",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_range_spans_year_boundary() {
        let start = NaiveDate::from_ymd_opt(2023, 11, 14).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        let months: Vec<String> = MonthKey::range(start, end).iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn month_key_last_day_handles_leap_february() {
        let key: MonthKey = "2024-02".parse().unwrap();
        assert_eq!(key.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn building_ids_round_trip() {
        let id = format_building_id(42);
        assert_eq!(id, "building_000042");
        assert_eq!(building_suffix(&id), Some("000042"));
        assert_eq!(building_suffix("building_42"), None);
        assert_eq!(index_from_file_name("building_", "building_000042.json"), Some(42));
        assert_eq!(index_from_file_name("building_", "building_x.json"), None);
    }

    #[test]
    fn deliverypoint_id_parses_both_suffixes() {
        let id = format_deliverypoint_id("000042", 3);
        assert_eq!(id, "deliverypoint_000042_003");
        assert_eq!(parse_deliverypoint_id(&id), Some(("000042", "003")));
        assert_eq!(parse_deliverypoint_id("deliverypoint_42_3"), None);
    }

    #[test]
    fn building_payload_rejects_out_of_range_latitude() {
        let payload = BuildingCreate {
            platform_code: "p1".into(),
            building_code: "b1".into(),
            name: "HQ".into(),
            latitude: Some(140.0),
            longitude: None,
            organisation: None,
            address: None,
            city: None,
            zipcode: None,
            country: None,
            typology: None,
            geographical_area: None,
            occupant: None,
            surface: None,
            reference_period_start: None,
            reference_period_end: None,
            weather_station: None,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn invoice_payload_rejects_reversed_dates() {
        let payload = InvoiceCreate {
            deliverypoint_id_primaire: "deliverypoint_000001_001".into(),
            invoice_code: "inv".into(),
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            value: 10.0,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn received_at_round_trips_wire_format() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let raw = format_received_at(ts);
        assert_eq!(raw, "2025-06-01T12:30:00Z");
        assert_eq!(parse_received_at(&raw), Some(ts));
    }
}
