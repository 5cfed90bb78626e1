//! Axum HTTP surface over the lake: per-entity CRUD writing bronze and
//! triggering silver rebuilds, degree-days ingestion, and the forecast proxy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use enerlake_adapters::{
    ForecastClient, ForecastError, ForecastRequest, HttpWeatherProvider, IndicatorBases,
    MonthlyIndicator, WeatherIndexProvider, WeatherProviderConfig, WeatherProviderError,
};
use enerlake_core::{
    building_suffix, format_building_id, format_deliverypoint_id, format_invoice_id,
    format_received_at, format_season_id, format_usage_data_id, new_invoice_batch_id,
    parse_deliverypoint_id, BuildingCreate, DeliveryPointCreate, InvoiceBatchCreate,
    InvoiceCreate, SeasonCreate, UsageDataCreate, ValidationError,
};
use enerlake_pipeline::cascade::{delete_building, delete_deliverypoint, CascadeError};
use enerlake_pipeline::gapfill::{GapFillError, GapFiller};
use enerlake_pipeline::{
    Lake, LakeConfig, PipelineError, Row, TableSpec, BUILDING, DEGREEDAYS, DELIVERYPOINT,
    INVOICE, SEASON, USAGE_DATA,
};
use enerlake_storage::LocalBlobStore;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "enerlake-web";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub lake: Arc<Lake>,
    pub gap_filler: Arc<GapFiller>,
    pub forecast: Arc<ForecastClient>,
}

impl AppState {
    pub fn new(
        lake: Arc<Lake>,
        provider: Arc<dyn WeatherIndexProvider>,
        forecast: ForecastClient,
    ) -> Self {
        let gap_filler = Arc::new(GapFiller::new(Arc::clone(&lake), provider));
        Self {
            lake,
            gap_filler,
            forecast: Arc::new(forecast),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// API failure taxonomy: 400 for payloads the caller can fix, 404 for
/// missing rows, 502 for upstream services, 500 for everything internal.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Upstream(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Upstream(detail) => (StatusCode::BAD_GATEWAY, detail),
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<CascadeError> for ApiError {
    fn from(err: CascadeError) -> Self {
        match err {
            CascadeError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{entity} {id} not found"))
            }
            aborted @ CascadeError::Aborted { .. } => ApiError::Internal(aborted.into()),
        }
    }
}

impl From<GapFillError> for ApiError {
    fn from(err: GapFillError) -> Self {
        match err {
            GapFillError::Provider(err) => ApiError::Upstream(err.to_string()),
            GapFillError::Pipeline(err) => err.into(),
        }
    }
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        ApiError::Upstream(err.to_string())
    }
}

type ApiResult = Result<Response, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/building/create", put(create_building))
        .route("/building/all", get(building_all))
        .route("/building/{id}", get(building_one).delete(building_delete))
        .route("/building/update/{id}", patch(building_update))
        .route("/deliverypoint/create", put(create_deliverypoint))
        .route("/deliverypoint/all", get(deliverypoint_all))
        .route("/deliverypoint/{id}", get(deliverypoint_one).delete(deliverypoint_delete))
        .route("/deliverypoint/update/{id}", patch(deliverypoint_update))
        .route("/invoice/create", put(create_invoice))
        .route("/invoice/batch_create", post(create_invoice_batch))
        .route("/invoice/all", get(invoice_all))
        .route("/invoice/{id}", get(invoice_one).delete(invoice_delete))
        .route("/invoice/update/{id}", patch(invoice_update))
        .route("/usage_data/create", put(create_usage_data))
        .route("/usage_data/all", get(usage_data_all))
        .route("/usage_data/{id}", get(usage_data_one).delete(usage_data_delete))
        .route("/usage_data/update/{id}", patch(usage_data_update))
        .route("/season/create", put(create_season))
        .route("/season/all", get(season_all))
        .route("/season/{id}", get(season_one).delete(season_delete))
        .route("/season/update/{id}", patch(season_update))
        .route("/degreedays/monthly", get(degreedays_monthly))
        .route("/degreedays/all", get(degreedays_all))
        .route("/forecast/resultat", post(forecast_resultat))
        .route("/statut", get(statut))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Shared handler plumbing
// ---------------------------------------------------------------------------

fn decode_payload<T: serde::de::DeserializeOwned>(body: JsonValue) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn payload_row<T: serde::Serialize>(payload: &T) -> Row {
    match serde_json::to_value(payload) {
        Ok(JsonValue::Object(map)) => map,
        _ => Row::new(),
    }
}

/// Writes the bronze document for a freshly assigned id, schedules the
/// silver rebuild, and shapes the create response.
async fn finish_create(
    state: &AppState,
    spec: &'static TableSpec,
    id: &str,
    mut doc: Row,
) -> ApiResult {
    let received_at = format_received_at(Utc::now());
    doc.insert(spec.id_column.to_string(), json!(id));
    doc.insert("received_at".to_string(), json!(received_at));

    state
        .lake
        .write_bronze(spec.entity, &format!("{id}.json"), &JsonValue::Object(doc))
        .await?;
    state.lake.spawn_rebuild(spec);
    info!(entity = spec.entity, id, "entity created");

    Ok(Json(json!({
        "result": true,
        "id": id,
        "received_at": received_at,
        "schema_version": SCHEMA_VERSION,
    }))
    .into_response())
}

async fn require_row(
    state: &AppState,
    spec: &'static TableSpec,
    id: &str,
) -> Result<Row, ApiError> {
    state
        .lake
        .find_row(spec, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{} {id} not found", spec.entity)))
}

async fn list_rows(state: &AppState, spec: &'static TableSpec) -> ApiResult {
    let rows = state.lake.all_rows(spec).await?;
    Ok(Json(json!({ "result": true, "count": rows.len(), "items": rows })).into_response())
}

async fn get_row(state: &AppState, spec: &'static TableSpec, id: &str) -> ApiResult {
    let row = require_row(state, spec, id).await?;
    Ok(Json(JsonValue::Object(row)).into_response())
}

/// Row delete for the leaf entities: drop the silver row and its bronze
/// document. Batch-ingested invoice rows have no standalone bronze file, so
/// an absent blob is not an error.
async fn delete_leaf_row(state: &AppState, spec: &'static TableSpec, id: &str) -> ApiResult {
    let removed = state
        .lake
        .remove_rows(spec, spec.id_column, id)
        .await?
        .unwrap_or(0);
    if removed == 0 {
        return Err(ApiError::NotFound(format!("{} {id} not found", spec.entity)));
    }
    state
        .lake
        .delete_bronze(spec.entity, &format!("{id}.json"))
        .await?;
    Ok(Json(json!({ "result": true, "deleted": removed })).into_response())
}

/// Re-reads a merged row as the entity's create payload so updates go
/// through the same field constraints as creates.
fn merged_payload<T: serde::de::DeserializeOwned>(
    spec: &'static TableSpec,
    row: &Row,
) -> Result<T, ApiError> {
    let mut doc = row.clone();
    doc.remove(spec.id_column);
    doc.remove("received_at");
    serde_json::from_value(JsonValue::Object(doc))
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

/// Partial update: only canonical non-id columns may be patched, and the
/// merged row must still pass the entity's create-time validation. It is then
/// written back to bronze under the row's own file name with a fresh
/// `received_at`, so the change survives full rebuilds.
async fn patch_row(
    state: &AppState,
    spec: &'static TableSpec,
    id: &str,
    body: JsonValue,
    validate: impl Fn(&Row) -> Result<(), ApiError>,
) -> Result<Row, ApiError> {
    let JsonValue::Object(patch) = body else {
        return Err(ApiError::BadRequest("patch body must be a JSON object".into()));
    };
    for key in patch.keys() {
        let known = spec.columns.iter().any(|c| c.name == key);
        if !known || key == spec.id_column || key == "received_at" {
            return Err(ApiError::BadRequest(format!("cannot patch field {key}")));
        }
    }

    let mut row = require_row(state, spec, id).await?;
    for (key, value) in patch {
        row.insert(key, value);
    }
    validate(&row)?;
    row.insert("received_at".to_string(), json!(format_received_at(Utc::now())));

    state
        .lake
        .write_bronze(spec.entity, &format!("{id}.json"), &JsonValue::Object(row.clone()))
        .await?;
    state.lake.update_row(spec, id, &row).await?;
    state.lake.spawn_rebuild(spec);
    Ok(row)
}

fn updated_response(row: Row) -> Response {
    let received_at = row.get("received_at").cloned().unwrap_or(JsonValue::Null);
    Json(json!({
        "result": true,
        "received_at": received_at,
        "schema_version": SCHEMA_VERSION,
        "item": row,
    }))
    .into_response()
}

/// Fire-and-forget degree-days coverage check for a building row that has a
/// weather station and a reference period.
fn spawn_gap_fill(state: &AppState, row: &Row) {
    let station = row.get("weather_station").and_then(|v| v.as_str());
    let start = row
        .get("reference_period_start")
        .and_then(|v| v.as_str())
        .and_then(|raw| raw.parse::<NaiveDate>().ok());
    let (Some(station), Some(start)) = (station, start) else {
        return;
    };
    let end = row
        .get("reference_period_end")
        .and_then(|v| v.as_str())
        .and_then(|raw| raw.parse::<NaiveDate>().ok())
        .unwrap_or_else(|| Utc::now().date_naive());

    let gap_filler = Arc::clone(&state.gap_filler);
    let station = station.to_string();
    tokio::spawn(async move {
        gap_filler.ensure_coverage(&station, start, end).await;
    });
}

// ---------------------------------------------------------------------------
// Create handlers
// ---------------------------------------------------------------------------

async fn create_building(State(state): State<AppState>, Json(body): Json<JsonValue>) -> ApiResult {
    let payload: BuildingCreate = decode_payload(body)?;
    payload.validate()?;

    let id = format_building_id(state.lake.next_building_index().await?);
    let doc = payload_row(&payload);
    let response = finish_create(&state, &BUILDING, &id, doc.clone()).await?;
    spawn_gap_fill(&state, &doc);
    Ok(response)
}

async fn create_deliverypoint(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let payload: DeliveryPointCreate = decode_payload(body)?;
    payload.validate()?;
    require_row(&state, &BUILDING, &payload.id_building_primaire).await?;

    let suffix = building_suffix(&payload.id_building_primaire)
        .ok_or_else(|| ApiError::BadRequest("invalid id_building_primaire".into()))?;
    let id = format_deliverypoint_id(suffix, state.lake.next_deliverypoint_index(suffix).await?);
    finish_create(&state, &DELIVERYPOINT, &id, payload_row(&payload)).await
}

async fn create_invoice(State(state): State<AppState>, Json(body): Json<JsonValue>) -> ApiResult {
    let payload: InvoiceCreate = decode_payload(body)?;
    payload.validate()?;
    require_row(&state, &DELIVERYPOINT, &payload.deliverypoint_id_primaire).await?;

    let (building, dp) = parse_deliverypoint_id(&payload.deliverypoint_id_primaire)
        .ok_or_else(|| ApiError::BadRequest("invalid deliverypoint_id_primaire".into()))?;
    let id = format_invoice_id(building, dp, state.lake.next_invoice_index(building, dp).await?);
    finish_create(&state, &INVOICE, &id, payload_row(&payload)).await
}

async fn create_invoice_batch(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let payload: InvoiceBatchCreate = decode_payload(body)?;
    payload.validate()?;

    // Ids are assigned per delivery point; a batch holding several invoices
    // for the same point gets consecutive suffixes.
    let mut next_by_dp: HashMap<(String, String), u32> = HashMap::new();
    let mut ids = Vec::with_capacity(payload.invoices.len());
    let mut items = Vec::with_capacity(payload.invoices.len());
    for invoice in &payload.invoices {
        require_row(&state, &DELIVERYPOINT, &invoice.deliverypoint_id_primaire).await?;
        let (building, dp) = parse_deliverypoint_id(&invoice.deliverypoint_id_primaire)
            .ok_or_else(|| ApiError::BadRequest("invalid deliverypoint_id_primaire".into()))?;

        let key = (building.to_string(), dp.to_string());
        let index = match next_by_dp.get(&key) {
            Some(index) => *index,
            None => state.lake.next_invoice_index(building, dp).await?,
        };
        next_by_dp.insert(key, index + 1);

        let id = format_invoice_id(building, dp, index);
        let mut item = payload_row(invoice);
        item.insert(INVOICE.id_column.to_string(), json!(id));
        ids.push(id);
        items.push(JsonValue::Object(item));
    }

    let now = Utc::now();
    let batch_id = new_invoice_batch_id(now);
    let received_at = format_received_at(now);
    let envelope = json!({
        "batch_id": batch_id,
        "received_at": received_at,
        "items": items,
    });
    state
        .lake
        .write_bronze(INVOICE.entity, &format!("{batch_id}.json"), &envelope)
        .await?;
    state.lake.spawn_rebuild(&INVOICE);
    info!(batch = %batch_id, invoices = ids.len(), "invoice batch created");

    Ok(Json(json!({
        "result": true,
        "batch_id": batch_id,
        "ids": ids,
        "received_at": received_at,
        "schema_version": SCHEMA_VERSION,
    }))
    .into_response())
}

async fn create_usage_data(State(state): State<AppState>, Json(body): Json<JsonValue>) -> ApiResult {
    let payload: UsageDataCreate = decode_payload(body)?;
    payload.validate()?;
    require_row(&state, &BUILDING, &payload.id_building_primaire).await?;

    let suffix = building_suffix(&payload.id_building_primaire)
        .ok_or_else(|| ApiError::BadRequest("invalid id_building_primaire".into()))?;
    let id = format_usage_data_id(suffix, state.lake.next_usage_data_index(suffix).await?);
    finish_create(&state, &USAGE_DATA, &id, payload_row(&payload)).await
}

async fn create_season(State(state): State<AppState>, Json(body): Json<JsonValue>) -> ApiResult {
    let payload: SeasonCreate = decode_payload(body)?;
    payload.validate()?;

    let id = format_season_id(state.lake.next_season_index().await?);
    finish_create(&state, &SEASON, &id, payload_row(&payload)).await
}

// ---------------------------------------------------------------------------
// Read / delete / update handlers
// ---------------------------------------------------------------------------

async fn building_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &BUILDING).await
}

async fn building_one(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    get_row(&state, &BUILDING, &id).await
}

async fn building_delete(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let report = delete_building(&state.lake, &id).await?;
    Ok(Json(json!({ "result": true, "report": report })).into_response())
}

async fn building_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let row = patch_row(&state, &BUILDING, &id, body, |row| {
        merged_payload::<BuildingCreate>(&BUILDING, row)?.validate()?;
        Ok(())
    })
    .await?;
    spawn_gap_fill(&state, &row);
    Ok(updated_response(row))
}

async fn deliverypoint_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &DELIVERYPOINT).await
}

async fn deliverypoint_one(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    get_row(&state, &DELIVERYPOINT, &id).await
}

async fn deliverypoint_delete(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let report = delete_deliverypoint(&state.lake, &id).await?;
    Ok(Json(json!({ "result": true, "report": report })).into_response())
}

async fn deliverypoint_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let row = patch_row(&state, &DELIVERYPOINT, &id, body, |row| {
        merged_payload::<DeliveryPointCreate>(&DELIVERYPOINT, row)?.validate()?;
        Ok(())
    })
    .await?;
    Ok(updated_response(row))
}

async fn invoice_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &INVOICE).await
}

async fn invoice_one(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    get_row(&state, &INVOICE, &id).await
}

async fn invoice_delete(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    delete_leaf_row(&state, &INVOICE, &id).await
}

async fn invoice_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let row = patch_row(&state, &INVOICE, &id, body, |row| {
        merged_payload::<InvoiceCreate>(&INVOICE, row)?.validate()?;
        Ok(())
    })
    .await?;
    Ok(updated_response(row))
}

async fn usage_data_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &USAGE_DATA).await
}

async fn usage_data_one(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    get_row(&state, &USAGE_DATA, &id).await
}

async fn usage_data_delete(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    delete_leaf_row(&state, &USAGE_DATA, &id).await
}

async fn usage_data_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let row = patch_row(&state, &USAGE_DATA, &id, body, |row| {
        merged_payload::<UsageDataCreate>(&USAGE_DATA, row)?.validate()?;
        Ok(())
    })
    .await?;
    Ok(updated_response(row))
}

async fn season_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &SEASON).await
}

async fn season_one(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    get_row(&state, &SEASON, &id).await
}

async fn season_delete(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    delete_leaf_row(&state, &SEASON, &id).await
}

async fn season_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let row = patch_row(&state, &SEASON, &id, body, |row| {
        merged_payload::<SeasonCreate>(&SEASON, row)?.validate()?;
        Ok(())
    })
    .await?;
    Ok(updated_response(row))
}

// ---------------------------------------------------------------------------
// Degree days, forecast, status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MonthlyQuery {
    station_id: String,
    start: NaiveDate,
    end: NaiveDate,
}

async fn degreedays_monthly(
    State(state): State<AppState>,
    Query(query): Query<MonthlyQuery>,
) -> ApiResult {
    if query.end < query.start {
        return Err(ApiError::BadRequest("end must be after or equal to start".into()));
    }
    let months = state
        .gap_filler
        .ingest_monthly(&query.station_id, query.start, query.end)
        .await?;
    Ok(Json(json!({
        "result": true,
        "station_id": query.station_id,
        "months": months.iter().map(ToString::to_string).collect::<Vec<_>>(),
    }))
    .into_response())
}

async fn degreedays_all(State(state): State<AppState>) -> ApiResult {
    list_rows(&state, &DEGREEDAYS).await
}

async fn forecast_resultat(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    let request: ForecastRequest = decode_payload(body)?;
    require_row(&state, &BUILDING, &request.id_building_primaire).await?;
    let result = state.forecast.run(&request).await?;
    Ok(Json(json!({ "result": result })).into_response())
}

async fn statut(State(_state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "service": "enerlake",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Stand-in used when no weather provider is configured; every call fails
/// with a decode error the gap filler logs and drops.
struct DisabledWeatherProvider;

#[async_trait]
impl WeatherIndexProvider for DisabledWeatherProvider {
    async fn monthly_indicators(
        &self,
        _station_id: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _bases: &IndicatorBases,
    ) -> Result<Vec<MonthlyIndicator>, WeatherProviderError> {
        Err(WeatherProviderError::Decode(
            "weather provider is not configured".to_string(),
        ))
    }
}

pub fn state_from_config(config: &LakeConfig) -> anyhow::Result<AppState> {
    let lake = Arc::new(Lake::new(Arc::new(LocalBlobStore::new(&config.data_dir))));
    let provider: Arc<dyn WeatherIndexProvider> = match &config.weather_base_url {
        Some(base_url) => Arc::new(HttpWeatherProvider::new(WeatherProviderConfig::new(
            base_url.clone(),
            config.weather_account_key.clone(),
            config.weather_security_key.clone(),
        ))?),
        None => Arc::new(DisabledWeatherProvider),
    };
    let forecast = ForecastClient::new(config.forecast_url.clone())?;
    Ok(AppState::new(lake, provider, forecast))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = LakeConfig::from_env();
    let state = state_from_config(&config)?;

    let scheduler =
        enerlake_pipeline::maybe_build_scheduler(Arc::clone(&state.lake), &config).await?;
    if let Some(mut scheduler) = scheduler {
        scheduler.start().await.map_err(|e| anyhow::anyhow!(e))?;
        info!(cron = %config.rebuild_cron, "silver rebuild scheduler started");
    }

    let port: u16 = std::env::var("ENERLAKE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %config.data_dir.display(), "serving lake api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let lake = Arc::new(Lake::new(Arc::new(LocalBlobStore::new(dir.path()))));
        let forecast = ForecastClient::new(None).expect("client");
        AppState::new(lake, Arc::new(DisabledWeatherProvider), forecast)
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn building_payload() -> JsonValue {
        json!({
            "platform_code": "p1",
            "building_code": "b1",
            "name": "HQ",
            "latitude": 43.5,
            "longitude": 5.4
        })
    }

    #[tokio::test]
    async fn statut_reports_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(&dir));
        let resp = app.oneshot(get_request("/statut")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn create_building_assigns_id_and_lands_in_silver() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["result"], json!(true));
        assert_eq!(body["id"], json!("building_000001"));
        assert_eq!(body["schema_version"], json!(1));

        // Creates rebuild in the background; force one so the read is stable.
        state.lake.rebuild(&BUILDING).await.expect("rebuild");

        let resp = app
            .oneshot(get_request("/building/building_000001"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let row = body_json(resp).await;
        assert_eq!(row["name"], json!("HQ"));
        assert_eq!(row["latitude"], json!(43.5));
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_with_400() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(&dir));

        let empty_name = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/building/create",
                json!({"platform_code": "p", "building_code": "b", "name": "  "}),
            ))
            .await
            .expect("response");
        assert_eq!(empty_name.status(), StatusCode::BAD_REQUEST);

        let unknown_field = app
            .oneshot(json_request(
                "PUT",
                "/building/create",
                json!({"platform_code": "p", "building_code": "b", "name": "x", "extra": 1}),
            ))
            .await
            .expect("response");
        assert_eq!(unknown_field.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_rows_return_404() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(&dir));

        let resp = app
            .clone()
            .oneshot(get_request("/building/building_000042"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/building/building_000042")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deliverypoint_create_requires_existing_building() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(&dir));

        let resp = app
            .oneshot(json_request(
                "PUT",
                "/deliverypoint/create",
                json!({
                    "id_building_primaire": "building_000001",
                    "deliverypoint_code": "dp",
                    "deliverypoint_number": "1",
                    "fluid": "elec",
                    "fluid_unit": "kWh"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_patches_row_and_refreshes_received_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("create");
        state.lake.rebuild(&BUILDING).await.expect("rebuild");

        let resp = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/building/update/building_000001",
                json!({"name": "renamed"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["item"]["name"], json!("renamed"));

        // Patching the id or an unknown column is rejected.
        let resp = app
            .oneshot(json_request(
                "PATCH",
                "/building/update/building_000001",
                json!({"id_building_primaire": "building_000009"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // A full rebuild must keep the patched value.
        state.lake.rebuild(&BUILDING).await.expect("rebuild");
        let row = state
            .lake
            .find_row(&BUILDING, "building_000001")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row["name"], json!("renamed"));
    }

    #[tokio::test]
    async fn update_rejects_values_the_create_would_reject() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("create building");
        state.lake.rebuild(&BUILDING).await.expect("rebuild");
        app.clone()
            .oneshot(json_request(
                "PUT",
                "/deliverypoint/create",
                json!({
                    "id_building_primaire": "building_000001",
                    "deliverypoint_code": "dp",
                    "deliverypoint_number": "1",
                    "fluid": "elec",
                    "fluid_unit": "kWh"
                }),
            ))
            .await
            .expect("create dp");
        state.lake.rebuild(&DELIVERYPOINT).await.expect("rebuild");
        app.clone()
            .oneshot(json_request(
                "PUT",
                "/invoice/create",
                json!({
                    "deliverypoint_id_primaire": "deliverypoint_000001_001",
                    "invoice_code": "f1",
                    "start": "2024-01-01",
                    "end": "2024-01-31",
                    "value": 100
                }),
            ))
            .await
            .expect("create invoice");
        state.lake.rebuild(&INVOICE).await.expect("rebuild");

        let resp = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/invoice/update/invoice_000001_001_01",
                json!({"value": -5}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/building/update/building_000001",
                json!({"latitude": 200.0}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Neither rejected patch may have touched the rows.
        let resp = app
            .oneshot(get_request("/invoice/invoice_000001_001_01"))
            .await
            .expect("response");
        let row = body_json(resp).await;
        assert_eq!(row["value"], json!(100.0));
    }

    #[tokio::test]
    async fn batch_create_assigns_consecutive_invoice_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("create building");
        state.lake.rebuild(&BUILDING).await.expect("rebuild");
        app.clone()
            .oneshot(json_request(
                "PUT",
                "/deliverypoint/create",
                json!({
                    "id_building_primaire": "building_000001",
                    "deliverypoint_code": "dp",
                    "deliverypoint_number": "1",
                    "fluid": "gaz",
                    "fluid_unit": "kWh"
                }),
            ))
            .await
            .expect("create dp");
        state.lake.rebuild(&DELIVERYPOINT).await.expect("rebuild");

        let invoices: Vec<_> = (1..=3)
            .map(|i| {
                json!({
                    "deliverypoint_id_primaire": "deliverypoint_000001_001",
                    "invoice_code": format!("f{i}"),
                    "start": "2024-01-01",
                    "end": "2024-01-31",
                    "value": 100 * i
                })
            })
            .collect();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/invoice/batch_create",
                json!({ "invoices": invoices }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(
            body["ids"],
            json!([
                "invoice_000001_001_01",
                "invoice_000001_001_02",
                "invoice_000001_001_03"
            ])
        );

        state.lake.rebuild(&INVOICE).await.expect("rebuild");
        assert_eq!(state.lake.all_rows(&INVOICE).await.expect("rows").len(), 3);
    }

    #[tokio::test]
    async fn cascade_delete_over_http_reports_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("create building");
        state.lake.rebuild(&BUILDING).await.expect("rebuild");
        app.clone()
            .oneshot(json_request(
                "PUT",
                "/usage_data/create",
                json!({
                    "id_building_primaire": "building_000001",
                    "type": "occupancy",
                    "date": "2024-01-01",
                    "value": 12
                }),
            ))
            .await
            .expect("create usage");
        state.lake.rebuild(&USAGE_DATA).await.expect("rebuild");

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/building/building_000001")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["report"]["usage_data_deleted"], json!(1));
        assert_eq!(
            body["report"]["completed_steps"],
            json!(["invoices", "deliverypoints", "usage_data", "building"])
        );

        let resp = app
            .oneshot(get_request("/building/all"))
            .await
            .expect("response");
        let body = body_json(resp).await;
        assert_eq!(body["count"], json!(0));
    }

    #[tokio::test]
    async fn forecast_without_configuration_maps_to_502() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir);
        let app = app(state.clone());

        app.clone()
            .oneshot(json_request("PUT", "/building/create", building_payload()))
            .await
            .expect("create building");
        state.lake.rebuild(&BUILDING).await.expect("rebuild");

        let resp = app
            .oneshot(json_request(
                "POST",
                "/forecast/resultat",
                json!({
                    "id_building_primaire": "building_000001",
                    "start_date_ref": "2023-01-01",
                    "end_date_ref": "2023-12-31",
                    "start_date_pred": "2024-01-01",
                    "end_date_pred": "2024-12-31"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
