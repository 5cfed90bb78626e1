//! Degree-days ingestion and the coverage gap filler.
//!
//! When a building gains a weather station and a reference period, every
//! month of that period should exist in the degree-days silver table. The
//! gap filler compares wanted months against present ones, fetches the
//! contiguous span covering the missing months in a single provider call,
//! writes one bronze document per recovered month, and rebuilds.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use enerlake_core::{format_received_at, MonthKey};
use enerlake_adapters::{
    IndicatorBases, MonthlyIndicator, WeatherIndexProvider, WeatherProviderError,
};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use crate::{Lake, PipelineError, DEGREEDAYS};

#[derive(Debug, Error)]
pub enum GapFillError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Provider(#[from] WeatherProviderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapFillOutcome {
    /// Every wanted month already had silver rows.
    AlreadyCovered,
    Filled { months: Vec<MonthKey> },
    /// The provider answered but returned nothing for the missing months.
    NoData,
}

pub struct GapFiller {
    lake: Arc<Lake>,
    provider: Arc<dyn WeatherIndexProvider>,
    bases: IndicatorBases,
}

fn bronze_file_name(station_id: &str, month: MonthKey) -> String {
    format!(
        "{:04}/{:02}/dd_{station_id}_{:04}_{:02}.json",
        month.year, month.month, month.year, month.month
    )
}

fn bronze_document(
    station_id: &str,
    month: MonthKey,
    readings: &[&MonthlyIndicator],
    received_at: &str,
) -> JsonValue {
    let data: Vec<JsonValue> = readings
        .iter()
        .map(|r| {
            json!({
                "month": r.month,
                "indicator.name": r.indicator.as_str(),
                "indicator.basis": r.basis,
                "value": r.value,
            })
        })
        .collect();
    json!({
        "station_id": station_id,
        "year": month.year,
        "month": month.month,
        "received_at": received_at,
        "data": data,
    })
}

impl GapFiller {
    pub fn new(lake: Arc<Lake>, provider: Arc<dyn WeatherIndexProvider>) -> Self {
        Self { lake, provider, bases: IndicatorBases::default() }
    }

    pub fn with_bases(mut self, bases: IndicatorBases) -> Self {
        self.bases = bases;
        self
    }

    async fn present_months(&self, station_id: &str) -> Result<BTreeSet<MonthKey>, PipelineError> {
        let rows = self.lake.all_rows(&DEGREEDAYS).await?;
        Ok(rows
            .iter()
            .filter(|row| {
                row.get("station_id").and_then(|v| v.as_str()) == Some(station_id)
            })
            .filter_map(|row| row.get("period_month").and_then(|v| v.as_str()))
            .filter_map(|raw| raw.parse().ok())
            .collect())
    }

    /// Writes one bronze document per month found in `readings`, returning
    /// the months written in ascending order.
    async fn write_monthly_documents(
        &self,
        station_id: &str,
        readings: &[MonthlyIndicator],
    ) -> Result<Vec<MonthKey>, PipelineError> {
        let mut by_month: std::collections::BTreeMap<MonthKey, Vec<&MonthlyIndicator>> =
            std::collections::BTreeMap::new();
        for reading in readings {
            if let Ok(month) = reading.month.parse::<MonthKey>() {
                by_month.entry(month).or_default().push(reading);
            }
        }

        let received_at = format_received_at(Utc::now());
        let mut written = Vec::new();
        for (month, month_readings) in by_month {
            let doc = bronze_document(station_id, month, &month_readings, &received_at);
            self.lake
                .write_bronze(DEGREEDAYS.entity, &bronze_file_name(station_id, month), &doc)
                .await?;
            written.push(month);
        }
        Ok(written)
    }

    /// Direct ingestion for the requested range. Provider failures propagate
    /// to the caller.
    pub async fn ingest_monthly(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MonthKey>, GapFillError> {
        let readings = self
            .provider
            .monthly_indicators(station_id, start, end, &self.bases)
            .await?;
        let written = self.write_monthly_documents(station_id, &readings).await?;
        if !written.is_empty() {
            self.lake.rebuild(&DEGREEDAYS).await?;
        }
        Ok(written)
    }

    async fn try_ensure_coverage(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<GapFillOutcome, GapFillError> {
        let wanted = MonthKey::range(start, end);
        if wanted.is_empty() {
            return Ok(GapFillOutcome::AlreadyCovered);
        }
        let present = self.present_months(station_id).await?;
        let missing: BTreeSet<MonthKey> = wanted
            .into_iter()
            .filter(|month| !present.contains(month))
            .collect();
        let (Some(&first), Some(&last)) = (missing.first(), missing.last()) else {
            return Ok(GapFillOutcome::AlreadyCovered);
        };

        // One provider call covering the whole span around the missing
        // months. The span can include months already ingested (holes are
        // not always contiguous); their readings are dropped so the existing
        // bronze documents stay untouched.
        let readings: Vec<MonthlyIndicator> = self
            .provider
            .monthly_indicators(station_id, first.first_day(), last.last_day(), &self.bases)
            .await?
            .into_iter()
            .filter(|r| {
                r.month
                    .parse::<MonthKey>()
                    .map_or(false, |month| missing.contains(&month))
            })
            .collect();
        let written = self.write_monthly_documents(station_id, &readings).await?;
        if written.is_empty() {
            return Ok(GapFillOutcome::NoData);
        }
        self.lake.rebuild(&DEGREEDAYS).await?;
        Ok(GapFillOutcome::Filled { months: written })
    }

    /// Best-effort coverage check, run after building create/update. Never
    /// fails the caller: insufficient provider coverage is expected for
    /// stations with short histories and is absorbed silently, anything else
    /// is logged and dropped.
    pub async fn ensure_coverage(&self, station_id: &str, start: NaiveDate, end: NaiveDate) {
        match self.try_ensure_coverage(station_id, start, end).await {
            Ok(GapFillOutcome::Filled { months }) => {
                info!(
                    station = station_id,
                    months = months.len(),
                    "degree-days coverage gap filled"
                );
            }
            Ok(GapFillOutcome::AlreadyCovered | GapFillOutcome::NoData) => {}
            Err(GapFillError::Provider(err)) if err.is_coverage_insufficient() => {}
            Err(err) => {
                warn!(station = station_id, %err, "degree-days gap fill failed");
            }
        }
    }
}
