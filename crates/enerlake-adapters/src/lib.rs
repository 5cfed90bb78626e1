//! External collaborators: the weather-index provider (monthly degree-day
//! readings per station) and the forecast computation service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use enerlake_core::Indicator;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "enerlake-adapters";

/// Temperature thresholds (°C) requested per indicator kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorBases {
    pub hdd: Vec<i32>,
    pub cdd: Vec<i32>,
}

impl Default for IndicatorBases {
    fn default() -> Self {
        Self {
            hdd: vec![10, 15, 18],
            cdd: vec![21, 24, 26],
        }
    }
}

/// One monthly degree-day reading as it is persisted into bronze. The field
/// renames match the historical bronze document layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyIndicator {
    pub station_id: String,
    /// Calendar month, `YYYY-MM`.
    pub month: String,
    #[serde(rename = "indicator.name")]
    pub indicator: Indicator,
    #[serde(rename = "indicator.basis")]
    pub basis: f64,
    pub value: f64,
}

#[derive(Debug, Error)]
pub enum WeatherProviderError {
    /// The provider does not hold enough recorded temperature readings for
    /// the requested station/range. Absorbed silently by the gap filler.
    #[error("insufficient recorded temperature readings for station {station_id}")]
    CoverageInsufficient { station_id: String },
    #[error("weather provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("weather provider returned an invalid payload: {0}")]
    Decode(String),
}

impl WeatherProviderError {
    pub fn is_coverage_insufficient(&self) -> bool {
        matches!(self, Self::CoverageInsufficient { .. })
    }
}

/// Contract consumed by the degree-days ingestion and gap-fill paths.
#[async_trait]
pub trait WeatherIndexProvider: Send + Sync {
    async fn monthly_indicators(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        bases: &IndicatorBases,
    ) -> Result<Vec<MonthlyIndicator>, WeatherProviderError>;
}

#[derive(Debug, Clone)]
pub struct WeatherProviderConfig {
    pub base_url: String,
    pub account_key: String,
    pub security_key: String,
    pub timeout: Duration,
}

impl WeatherProviderConfig {
    pub fn new(base_url: impl Into<String>, account_key: impl Into<String>, security_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            account_key: account_key.into(),
            security_key: security_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderEnvelope {
    #[serde(default)]
    error: Option<ProviderErrorBody>,
    #[serde(default)]
    data: Vec<ProviderReading>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderReading {
    month: String,
    indicator: Indicator,
    basis: f64,
    value: f64,
}

/// HTTP implementation of the weather-index contract.
#[derive(Debug)]
pub struct HttpWeatherProvider {
    client: reqwest::Client,
    config: WeatherProviderConfig,
}

impl HttpWeatherProvider {
    pub fn new(config: WeatherProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building weather provider client")?;
        Ok(Self { client, config })
    }
}

fn classify_provider_error(code: &str, station_id: &str) -> WeatherProviderError {
    if code.contains("SourceDataCoverage") || code.contains("NotEnoughData") {
        WeatherProviderError::CoverageInsufficient {
            station_id: station_id.to_string(),
        }
    } else {
        WeatherProviderError::Decode(format!("provider error code {code}"))
    }
}

fn decode_envelope(
    envelope: ProviderEnvelope,
    station_id: &str,
) -> Result<Vec<MonthlyIndicator>, WeatherProviderError> {
    if let Some(error) = envelope.error {
        let code = match &error.message {
            Some(message) => format!("{} ({message})", error.code),
            None => error.code.clone(),
        };
        return Err(classify_provider_error(&code, station_id));
    }
    Ok(envelope
        .data
        .into_iter()
        .map(|reading| MonthlyIndicator {
            station_id: station_id.to_string(),
            month: reading.month,
            indicator: reading.indicator,
            basis: reading.basis,
            value: reading.value,
        })
        .collect())
}

#[async_trait]
impl WeatherIndexProvider for HttpWeatherProvider {
    async fn monthly_indicators(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        bases: &IndicatorBases,
    ) -> Result<Vec<MonthlyIndicator>, WeatherProviderError> {
        let url = format!("{}/monthly", self.config.base_url.trim_end_matches('/'));
        let hdd_bases = bases
            .hdd
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let cdd_bases = bases
            .cdd
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("station_id", station_id),
                ("start", &start.to_string()),
                ("end", &end.to_string()),
                ("hdd_bases", &hdd_bases),
                ("cdd_bases", &cdd_bases),
                ("account_key", &self.config.account_key),
                ("security_key", &self.config.security_key),
            ])
            .send()
            .await?
            .error_for_status()?;

        let envelope: ProviderEnvelope = response
            .json()
            .await
            .map_err(|e| WeatherProviderError::Decode(e.to_string()))?;
        decode_envelope(envelope, station_id)
    }
}

// ---------------------------------------------------------------------------
// Forecast service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub id_building_primaire: String,
    pub start_date_ref: NaiveDate,
    pub end_date_ref: NaiveDate,
    pub start_date_pred: NaiveDate,
    pub end_date_pred: NaiveDate,
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast service url is not configured")]
    NotConfigured,
    #[error("forecast service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forecast service returned an invalid payload: {0}")]
    Decode(String),
}

/// Thin client for the external prediction service. The computation itself
/// lives behind an HTTP endpoint; this side only delegates and unwraps the
/// `{duration_ms, result}` envelope when present.
#[derive(Debug)]
pub struct ForecastClient {
    client: reqwest::Client,
    url: Option<String>,
}

impl ForecastClient {
    pub fn new(url: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building forecast client")?;
        Ok(Self { client, url })
    }

    pub async fn run(&self, request: &ForecastRequest) -> Result<JsonValue, ForecastError> {
        let url = self.url.as_deref().ok_or(ForecastError::NotConfigured)?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| ForecastError::Decode(e.to_string()))?;
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}
