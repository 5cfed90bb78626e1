//! Bronze -> silver pipeline: the generic snapshot rebuild engine, the
//! per-entity table specs, and row-level silver operations shared by the
//! HTTP surface.
//!
//! Bronze documents are immutable JSON blobs, one per write event. Silver is
//! a single Parquet snapshot per entity, fully recomputed from bronze on each
//! rebuild: flatten, typecast permissively, dedup by business key keeping the
//! most recent `received_at`, and overwrite the snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, NaiveDate, Utc};
use enerlake_core::{format_received_at, index_from_file_name, parse_received_at};
use enerlake_storage::{BlobStore, StorageError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod cascade;
pub mod gapfill;

pub const CRATE_NAME: &str = "enerlake-pipeline";

/// A silver row: canonical columns to normalized JSON values.
pub type Row = JsonMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("parquet codec failure for {entity}: {source}")]
    Parquet {
        entity: &'static str,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error("arrow batch failure for {entity}: {source}")]
    Arrow {
        entity: &'static str,
        #[source]
        source: arrow_schema::ArrowError,
    },
    #[error("scheduler setup failed: {0}")]
    Scheduler(String),
}

// ---------------------------------------------------------------------------
// Table specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Float64,
    Int64,
    Date,
    Timestamp,
}

/// One canonical silver column. `range` nulls numeric values outside the
/// closed interval instead of rejecting the row (used for coordinates).
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub range: Option<(f64, f64)>,
}

impl ColumnSpec {
    pub const fn utf8(name: &'static str) -> Self {
        Self { name, ty: ColumnType::Utf8, range: None }
    }
    pub const fn f64(name: &'static str) -> Self {
        Self { name, ty: ColumnType::Float64, range: None }
    }
    pub const fn f64_range(name: &'static str, lo: f64, hi: f64) -> Self {
        Self { name, ty: ColumnType::Float64, range: Some((lo, hi)) }
    }
    pub const fn i64(name: &'static str) -> Self {
        Self { name, ty: ColumnType::Int64, range: None }
    }
    pub const fn date(name: &'static str) -> Self {
        Self { name, ty: ColumnType::Date, range: None }
    }
    pub const fn timestamp(name: &'static str) -> Self {
        Self { name, ty: ColumnType::Timestamp, range: None }
    }
}

type FlattenFn = fn(&JsonValue) -> Vec<Row>;

/// Everything the generic engine needs to know about one entity.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    /// Entity name, also the bronze directory under `bronze/`.
    pub entity: &'static str,
    pub bronze_prefix: &'static str,
    pub snapshot_path: &'static str,
    /// Primary id column used by the row-level CRUD paths.
    pub id_column: &'static str,
    /// Business-key columns used for dedup during rebuild.
    pub key_columns: &'static [&'static str],
    pub columns: &'static [ColumnSpec],
    pub flatten: FlattenFn,
}

fn flatten_single(doc: &JsonValue) -> Vec<Row> {
    match doc.as_object() {
        Some(map) => vec![map.clone()],
        None => Vec::new(),
    }
}

/// Invoices arrive either as single documents or as batch envelopes
/// (`items`, historically also `invoices`). Batch items inherit the envelope
/// `received_at` when they lack their own.
fn flatten_invoice(doc: &JsonValue) -> Vec<Row> {
    let Some(map) = doc.as_object() else {
        return Vec::new();
    };
    let items = map
        .get("items")
        .or_else(|| map.get("invoices"))
        .and_then(JsonValue::as_array);
    let Some(items) = items else {
        return vec![map.clone()];
    };

    let envelope_received_at = map.get("received_at").cloned();
    items
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|item| {
            let mut row = item.clone();
            if !row.contains_key("received_at") {
                if let Some(ts) = &envelope_received_at {
                    row.insert("received_at".to_string(), ts.clone());
                }
            }
            row
        })
        .collect()
}

/// Degree-days documents carry one `data` entry per (indicator, basis); each
/// explodes into its own silver row inheriting the parent station and
/// timestamp.
fn flatten_degreedays(doc: &JsonValue) -> Vec<Row> {
    let Some(map) = doc.as_object() else {
        return Vec::new();
    };
    let items = map.get("data").and_then(JsonValue::as_array);
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|item| {
            let mut row = Row::new();
            row.insert("station_id".into(), map.get("station_id").cloned().unwrap_or(JsonValue::Null));
            row.insert("year".into(), map.get("year").cloned().unwrap_or(JsonValue::Null));
            row.insert("month".into(), map.get("month").cloned().unwrap_or(JsonValue::Null));
            row.insert("period_month".into(), item.get("month").cloned().unwrap_or(JsonValue::Null));
            row.insert(
                "indicator".into(),
                item.get("indicator.name").cloned().unwrap_or(JsonValue::Null),
            );
            row.insert(
                "basis".into(),
                item.get("indicator.basis").cloned().unwrap_or(JsonValue::Null),
            );
            row.insert("value".into(), item.get("value").cloned().unwrap_or(JsonValue::Null));
            let received_at = item
                .get("received_at")
                .or_else(|| map.get("received_at"))
                .cloned()
                .unwrap_or(JsonValue::Null);
            row.insert("received_at".into(), received_at);
            row
        })
        .collect()
}

pub static BUILDING: TableSpec = TableSpec {
    entity: "building",
    bronze_prefix: "bronze/building",
    snapshot_path: "silver/building/building.parquet",
    id_column: "id_building_primaire",
    key_columns: &["id_building_primaire"],
    columns: &[
        ColumnSpec::utf8("id_building_primaire"),
        ColumnSpec::utf8("platform_code"),
        ColumnSpec::utf8("building_code"),
        ColumnSpec::utf8("name"),
        ColumnSpec::f64_range("latitude", -90.0, 90.0),
        ColumnSpec::f64_range("longitude", -180.0, 180.0),
        ColumnSpec::utf8("organisation"),
        ColumnSpec::utf8("address"),
        ColumnSpec::utf8("city"),
        ColumnSpec::utf8("zipcode"),
        ColumnSpec::utf8("country"),
        ColumnSpec::utf8("typology"),
        ColumnSpec::i64("geographical_area"),
        ColumnSpec::i64("occupant"),
        ColumnSpec::f64("surface"),
        ColumnSpec::date("reference_period_start"),
        ColumnSpec::date("reference_period_end"),
        ColumnSpec::utf8("weather_station"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_single,
};

pub static DELIVERYPOINT: TableSpec = TableSpec {
    entity: "deliverypoint",
    bronze_prefix: "bronze/deliverypoint",
    snapshot_path: "silver/deliverypoint/deliverypoint.parquet",
    id_column: "deliverypoint_id_primaire",
    key_columns: &["deliverypoint_id_primaire"],
    columns: &[
        ColumnSpec::utf8("deliverypoint_id_primaire"),
        ColumnSpec::utf8("id_building_primaire"),
        ColumnSpec::utf8("deliverypoint_code"),
        ColumnSpec::utf8("deliverypoint_number"),
        ColumnSpec::utf8("fluid"),
        ColumnSpec::utf8("fluid_unit"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_single,
};

pub static INVOICE: TableSpec = TableSpec {
    entity: "invoice",
    bronze_prefix: "bronze/invoice",
    snapshot_path: "silver/invoice/invoice.parquet",
    id_column: "invoice_id_primaire",
    key_columns: &["invoice_id_primaire"],
    columns: &[
        ColumnSpec::utf8("invoice_id_primaire"),
        ColumnSpec::utf8("deliverypoint_id_primaire"),
        ColumnSpec::utf8("invoice_code"),
        ColumnSpec::date("start"),
        ColumnSpec::date("end"),
        ColumnSpec::f64("value"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_invoice,
};

pub static USAGE_DATA: TableSpec = TableSpec {
    entity: "usage_data",
    bronze_prefix: "bronze/usage_data",
    snapshot_path: "silver/usage_data/usage_data.parquet",
    id_column: "usage_data_id_primaire",
    key_columns: &["usage_data_id_primaire"],
    columns: &[
        ColumnSpec::utf8("usage_data_id_primaire"),
        ColumnSpec::utf8("id_building_primaire"),
        ColumnSpec::utf8("type"),
        ColumnSpec::date("date"),
        ColumnSpec::f64("value"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_single,
};

pub static SEASON: TableSpec = TableSpec {
    entity: "season",
    bronze_prefix: "bronze/season",
    snapshot_path: "silver/season/season.parquet",
    id_column: "season_id_primaire",
    key_columns: &["season_id_primaire"],
    columns: &[
        ColumnSpec::utf8("season_id_primaire"),
        ColumnSpec::utf8("name"),
        ColumnSpec::date("start_date"),
        ColumnSpec::date("end_date"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_single,
};

pub static DEGREEDAYS: TableSpec = TableSpec {
    entity: "degreedays",
    bronze_prefix: "bronze/degreedays",
    snapshot_path: "silver/degreedays/degreedays_monthly.parquet",
    id_column: "period_month",
    key_columns: &["station_id", "period_month", "indicator", "basis"],
    columns: &[
        ColumnSpec::utf8("station_id"),
        ColumnSpec::i64("year"),
        ColumnSpec::i64("month"),
        ColumnSpec::utf8("period_month"),
        ColumnSpec::utf8("indicator"),
        ColumnSpec::f64("basis"),
        ColumnSpec::f64("value"),
        ColumnSpec::timestamp("received_at"),
    ],
    flatten: flatten_degreedays,
};

pub fn all_specs() -> [&'static TableSpec; 6] {
    [&BUILDING, &DELIVERYPOINT, &INVOICE, &USAGE_DATA, &SEASON, &DEGREEDAYS]
}

pub fn spec_for(entity: &str) -> Option<&'static TableSpec> {
    all_specs().into_iter().find(|spec| spec.entity == entity)
}

// ---------------------------------------------------------------------------
// Permissive type coercion
// ---------------------------------------------------------------------------

fn coerce_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        }
        _ => None,
    }
}

fn coerce_date(value: &JsonValue) -> Option<NaiveDate> {
    let raw = value.as_str()?;
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn coerce_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    parse_received_at(value.as_str()?)
}

fn coerce_utf8(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Coerces one raw cell to the column's normalized JSON representation.
/// Malformed input becomes null, never an error.
pub fn coerce_cell(spec: &ColumnSpec, value: Option<&JsonValue>) -> JsonValue {
    let Some(value) = value else {
        return JsonValue::Null;
    };
    if value.is_null() {
        return JsonValue::Null;
    }
    match spec.ty {
        ColumnType::Utf8 => coerce_utf8(value).map(JsonValue::from).unwrap_or(JsonValue::Null),
        ColumnType::Float64 => {
            let parsed = coerce_f64(value)
                .filter(|v| spec.range.map_or(true, |(lo, hi)| (lo..=hi).contains(v)));
            parsed.map(JsonValue::from).unwrap_or(JsonValue::Null)
        }
        ColumnType::Int64 => coerce_i64(value).map(JsonValue::from).unwrap_or(JsonValue::Null),
        ColumnType::Date => coerce_date(value)
            .map(|d| JsonValue::from(d.to_string()))
            .unwrap_or(JsonValue::Null),
        ColumnType::Timestamp => coerce_timestamp(value)
            .map(|ts| JsonValue::from(format_received_at(ts)))
            .unwrap_or(JsonValue::Null),
    }
}

/// Reorders a raw flattened document onto the canonical column set, adding
/// missing columns as null.
pub fn coerce_row(spec: &TableSpec, raw: &Row) -> Row {
    let mut row = Row::new();
    for column in spec.columns {
        row.insert(column.name.to_string(), coerce_cell(column, raw.get(column.name)));
    }
    row
}

// ---------------------------------------------------------------------------
// Rebuild engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SourcedRow {
    row: Row,
    source: String,
}

fn business_key(spec: &TableSpec, row: &Row) -> Option<Vec<String>> {
    spec.key_columns
        .iter()
        .map(|name| {
            row.get(*name)
                .filter(|v| !v.is_null())
                .map(JsonValue::to_string)
        })
        .collect()
}

fn row_received_at(row: &Row) -> Option<DateTime<Utc>> {
    row.get("received_at").and_then(|v| v.as_str()).and_then(parse_received_at)
}

/// Last-write-wins collapse: sort by (business key, received_at, source
/// path) and keep the last document per key. The source-path component makes
/// the tie-break on equal timestamps deterministic. Rows without a complete
/// business key are kept as-is.
fn dedup_rows(spec: &TableSpec, rows: Vec<SourcedRow>) -> Vec<Row> {
    let mut keyed: Vec<(Vec<String>, SourcedRow)> = Vec::new();
    let mut unkeyed: Vec<SourcedRow> = Vec::new();
    for sourced in rows {
        match business_key(spec, &sourced.row) {
            Some(key) => keyed.push((key, sourced)),
            None => unkeyed.push(sourced),
        }
    }

    keyed.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| row_received_at(&a.1.row).cmp(&row_received_at(&b.1.row)))
            .then_with(|| a.1.source.cmp(&b.1.source))
    });

    let mut winners: BTreeMap<Vec<String>, Row> = BTreeMap::new();
    for (key, sourced) in keyed {
        winners.insert(key, sourced.row);
    }

    unkeyed.sort_by(|a, b| a.source.cmp(&b.source));

    let mut out: Vec<Row> = winners.into_values().collect();
    out.extend(unkeyed.into_iter().map(|s| s.row));
    out
}

/// The generic bronze -> silver rebuild, instantiated per entity.
#[derive(Debug, Clone, Copy)]
pub struct SilverTable {
    spec: &'static TableSpec,
}

impl SilverTable {
    pub fn new(spec: &'static TableSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &'static TableSpec {
        self.spec
    }

    async fn collect_bronze_rows(
        &self,
        store: &dyn BlobStore,
    ) -> Result<Vec<SourcedRow>, PipelineError> {
        let entries = store.list(self.spec.bronze_prefix).await?;
        let mut rows = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_directory) {
            let Some(bytes) = store.get(&entry.name).await? else {
                // listed but gone: raced with a delete, treat as absent
                continue;
            };
            let doc: JsonValue = match serde_json::from_slice(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(blob = %entry.name, %err, "skipping malformed bronze document");
                    continue;
                }
            };
            for raw in (self.spec.flatten)(&doc) {
                rows.push(SourcedRow {
                    row: coerce_row(self.spec, &raw),
                    source: entry.name.clone(),
                });
            }
        }
        Ok(rows)
    }

    /// Full recompute of the silver snapshot. Returns the final row count.
    /// An empty bronze set writes nothing and reports zero.
    pub async fn rebuild(&self, store: &dyn BlobStore) -> Result<usize, PipelineError> {
        let sourced = self.collect_bronze_rows(store).await?;
        if sourced.is_empty() {
            info!(entity = self.spec.entity, "no bronze documents, skipping snapshot write");
            return Ok(0);
        }
        let rows = dedup_rows(self.spec, sourced);
        self.save(store, &rows).await?;
        info!(entity = self.spec.entity, rows = rows.len(), "silver snapshot rebuilt");
        Ok(rows.len())
    }

    /// Reads the current snapshot; `None` when it has never been written.
    pub async fn load(&self, store: &dyn BlobStore) -> Result<Option<Vec<Row>>, PipelineError> {
        let Some(bytes) = store.get(self.spec.snapshot_path).await? else {
            return Ok(None);
        };
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
            .and_then(|builder| builder.build())
            .map_err(|source| PipelineError::Parquet { entity: self.spec.entity, source })?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch
                .map_err(|source| PipelineError::Arrow { entity: self.spec.entity, source })?;
            rows.extend(batch_to_rows(self.spec, &batch));
        }
        Ok(Some(rows))
    }

    /// Overwrites the snapshot with the given rows.
    pub async fn save(&self, store: &dyn BlobStore, rows: &[Row]) -> Result<(), PipelineError> {
        let batch = rows_to_batch(self.spec, rows)?;
        let mut buffer = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
                .map_err(|source| PipelineError::Parquet { entity: self.spec.entity, source })?;
            writer
                .write(&batch)
                .map_err(|source| PipelineError::Parquet { entity: self.spec.entity, source })?;
            writer
                .close()
                .map_err(|source| PipelineError::Parquet { entity: self.spec.entity, source })?;
        }
        store.put(self.spec.snapshot_path, &buffer).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row <-> Arrow conversion
// ---------------------------------------------------------------------------

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")
}

fn arrow_field(column: &ColumnSpec) -> Field {
    let ty = match column.ty {
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
    };
    Field::new(column.name, ty, true)
}

fn rows_to_batch(spec: &TableSpec, rows: &[Row]) -> Result<RecordBatch, PipelineError> {
    let schema = Arc::new(Schema::new(
        spec.columns.iter().map(arrow_field).collect::<Vec<_>>(),
    ));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(spec.columns.len());
    for column in spec.columns {
        let cells = rows.iter().map(|row| row.get(column.name));
        let array: ArrayRef = match column.ty {
            ColumnType::Utf8 => Arc::new(StringArray::from(
                cells.map(|v| v.and_then(|v| v.as_str()).map(str::to_string)).collect::<Vec<_>>(),
            )),
            ColumnType::Float64 => Arc::new(Float64Array::from(
                cells.map(|v| v.and_then(JsonValue::as_f64)).collect::<Vec<_>>(),
            )),
            ColumnType::Int64 => Arc::new(Int64Array::from(
                cells.map(|v| v.and_then(JsonValue::as_i64)).collect::<Vec<_>>(),
            )),
            ColumnType::Date => Arc::new(Date32Array::from(
                cells
                    .map(|v| {
                        v.and_then(coerce_date)
                            .map(|d| (d - epoch()).num_days() as i32)
                    })
                    .collect::<Vec<_>>(),
            )),
            ColumnType::Timestamp => Arc::new(TimestampMillisecondArray::from(
                cells
                    .map(|v| v.and_then(coerce_timestamp).map(|ts| ts.timestamp_millis()))
                    .collect::<Vec<_>>(),
            )),
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays)
        .map_err(|source| PipelineError::Arrow { entity: spec.entity, source })
}

fn batch_to_rows(spec: &TableSpec, batch: &RecordBatch) -> Vec<Row> {
    let mut rows = vec![Row::new(); batch.num_rows()];
    for column in spec.columns {
        let array = batch.column_by_name(column.name);
        for (idx, row) in rows.iter_mut().enumerate() {
            let value = array.map_or(JsonValue::Null, |array| cell_from_array(column, array, idx));
            row.insert(column.name.to_string(), value);
        }
    }
    rows
}

fn cell_from_array(column: &ColumnSpec, array: &ArrayRef, idx: usize) -> JsonValue {
    if array.is_null(idx) {
        return JsonValue::Null;
    }
    match column.ty {
        ColumnType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map_or(JsonValue::Null, |a| JsonValue::from(a.value(idx).to_string())),
        ColumnType::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map_or(JsonValue::Null, |a| JsonValue::from(a.value(idx))),
        ColumnType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map_or(JsonValue::Null, |a| JsonValue::from(a.value(idx))),
        ColumnType::Date => array
            .as_any()
            .downcast_ref::<Date32Array>()
            .and_then(|a| {
                epoch().checked_add_signed(chrono::Duration::days(a.value(idx) as i64))
            })
            .map_or(JsonValue::Null, |d| JsonValue::from(d.to_string())),
        ColumnType::Timestamp => array
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .and_then(|a| DateTime::<Utc>::from_timestamp_millis(a.value(idx)))
            .map_or(JsonValue::Null, |ts| JsonValue::from(format_received_at(ts))),
    }
}

// ---------------------------------------------------------------------------
// Lake: shared silver/bronze operations with per-entity write serialization
// ---------------------------------------------------------------------------

/// Shared handle over the blob store. All snapshot writes for one entity,
/// full rebuilds and row-level load-filter-save alike, go through the same
/// `tokio::sync::Mutex`, which closes the read-recompute-overwrite race
/// between concurrent background rebuilds in this process.
pub struct Lake {
    store: Arc<dyn BlobStore>,
    locks: HashMap<&'static str, Arc<Mutex<()>>>,
}

impl Lake {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let locks = all_specs()
            .into_iter()
            .map(|spec| (spec.entity, Arc::new(Mutex::new(()))))
            .collect();
        Self { store, locks }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    fn lock_for(&self, entity: &'static str) -> Arc<Mutex<()>> {
        self.locks
            .get(entity)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }

    pub async fn rebuild(&self, spec: &'static TableSpec) -> Result<usize, PipelineError> {
        let lock = self.lock_for(spec.entity);
        let _guard = lock.lock().await;
        SilverTable::new(spec).rebuild(self.store.as_ref()).await
    }

    /// Fire-and-forget rebuild, scheduled after the API response is sent.
    /// Failures are logged and never surface to the caller.
    pub fn spawn_rebuild(self: &Arc<Self>, spec: &'static TableSpec) {
        let lake = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = lake.rebuild(spec).await {
                warn!(entity = spec.entity, %err, "background silver rebuild failed");
            }
        });
    }

    /// All rows, treating a missing snapshot as an empty table.
    pub async fn all_rows(&self, spec: &'static TableSpec) -> Result<Vec<Row>, PipelineError> {
        Ok(SilverTable::new(spec)
            .load(self.store.as_ref())
            .await?
            .unwrap_or_default())
    }

    pub async fn find_row(
        &self,
        spec: &'static TableSpec,
        id: &str,
    ) -> Result<Option<Row>, PipelineError> {
        let rows = self.all_rows(spec).await?;
        Ok(rows.into_iter().find(|row| cell_eq(row, spec.id_column, id)))
    }

    pub async fn row_exists(
        &self,
        spec: &'static TableSpec,
        id: &str,
    ) -> Result<bool, PipelineError> {
        Ok(self.find_row(spec, id).await?.is_some())
    }

    /// Rows matching `column == value`; empty when the snapshot is absent.
    pub async fn rows_where(
        &self,
        spec: &'static TableSpec,
        column: &str,
        value: &str,
    ) -> Result<Vec<Row>, PipelineError> {
        let rows = self.all_rows(spec).await?;
        Ok(rows.into_iter().filter(|row| cell_eq(row, column, value)).collect())
    }

    /// Load-filter-save removal. `None` when the snapshot does not exist;
    /// otherwise the number of rows removed (zero meaning not found).
    pub async fn remove_rows(
        &self,
        spec: &'static TableSpec,
        column: &str,
        value: &str,
    ) -> Result<Option<usize>, PipelineError> {
        let lock = self.lock_for(spec.entity);
        let _guard = lock.lock().await;

        let table = SilverTable::new(spec);
        let Some(rows) = table.load(self.store.as_ref()).await? else {
            return Ok(None);
        };
        let before = rows.len();
        let kept: Vec<Row> = rows.into_iter().filter(|row| !cell_eq(row, column, value)).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(Some(0));
        }
        table.save(self.store.as_ref(), &kept).await?;
        Ok(Some(removed))
    }

    /// Patches the matching silver row column by column, coercing the patch
    /// values through the table spec. Returns false when the snapshot or the
    /// row is missing.
    pub async fn update_row(
        &self,
        spec: &'static TableSpec,
        id: &str,
        patch: &Row,
    ) -> Result<bool, PipelineError> {
        let lock = self.lock_for(spec.entity);
        let _guard = lock.lock().await;

        let table = SilverTable::new(spec);
        let Some(mut rows) = table.load(self.store.as_ref()).await? else {
            return Ok(false);
        };
        let Some(row) = rows.iter_mut().find(|row| cell_eq(row, spec.id_column, id)) else {
            return Ok(false);
        };
        for column in spec.columns {
            if let Some(value) = patch.get(column.name) {
                row.insert(column.name.to_string(), coerce_cell(column, Some(value)));
            }
        }
        table.save(self.store.as_ref(), &rows).await?;
        Ok(true)
    }

    // -- bronze writes --------------------------------------------------

    /// Writes one pretty-printed JSON document under `bronze/<entity>/`.
    /// Overwrite-by-filename is the update mechanism for bronze.
    pub async fn write_bronze(
        &self,
        entity: &str,
        file_name: &str,
        payload: &JsonValue,
    ) -> Result<(), PipelineError> {
        let path = enerlake_storage::bronze_file(entity, file_name);
        let bytes = serde_json::to_vec_pretty(payload).expect("bronze payloads are valid json");
        self.store.put(&path, &bytes).await?;
        Ok(())
    }

    /// Best-effort bronze removal; a blob that is already gone is logged.
    pub async fn delete_bronze(&self, entity: &str, file_name: &str) -> Result<bool, PipelineError> {
        let path = enerlake_storage::bronze_file(entity, file_name);
        let deleted = self.store.delete(&path).await?;
        if !deleted {
            warn!(%path, "bronze blob already absent on delete");
        }
        Ok(deleted)
    }

    // -- storage-derived id generation ---------------------------------

    async fn next_bronze_index(&self, prefix_dir: &str, file_prefix: &str) -> Result<u32, PipelineError> {
        let entries = self.store.list(prefix_dir).await?;
        let max = entries
            .iter()
            .filter(|e| !e.is_directory)
            .filter_map(|e| index_from_file_name(file_prefix, e.file_name()))
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    pub async fn next_building_index(&self) -> Result<u32, PipelineError> {
        self.next_bronze_index(BUILDING.bronze_prefix, "building_").await
    }

    pub async fn next_deliverypoint_index(&self, building_suffix: &str) -> Result<u32, PipelineError> {
        let prefix = format!("deliverypoint_{building_suffix}_");
        self.next_bronze_index(DELIVERYPOINT.bronze_prefix, &prefix).await
    }

    pub async fn next_usage_data_index(&self, building_suffix: &str) -> Result<u32, PipelineError> {
        let prefix = format!("usage_data_{building_suffix}_");
        self.next_bronze_index(USAGE_DATA.bronze_prefix, &prefix).await
    }

    pub async fn next_season_index(&self) -> Result<u32, PipelineError> {
        self.next_bronze_index(SEASON.bronze_prefix, "season_").await
    }

    /// Invoices no longer keep one bronze document per row (batches), so the
    /// next index per delivery point is derived from silver instead.
    pub async fn next_invoice_index(
        &self,
        building_suffix: &str,
        dp_suffix: &str,
    ) -> Result<u32, PipelineError> {
        let prefix = format!("invoice_{building_suffix}_{dp_suffix}_");
        let rows = self.all_rows(&INVOICE).await?;
        let max = rows
            .iter()
            .filter_map(|row| row.get("invoice_id_primaire").and_then(|v| v.as_str()))
            .filter_map(|id| {
                let digits = id.strip_prefix(&prefix)?;
                digits
                    .bytes()
                    .all(|b| b.is_ascii_digit())
                    .then(|| digits.parse::<u32>().ok())
                    .flatten()
            })
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }
}

fn cell_eq(row: &Row, column: &str, value: &str) -> bool {
    row.get(column).and_then(|v| v.as_str()) == Some(value)
}

// ---------------------------------------------------------------------------
// Configuration + cron-driven full rebuilds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LakeConfig {
    pub data_dir: std::path::PathBuf,
    pub scheduler_enabled: bool,
    pub rebuild_cron: String,
    pub weather_base_url: Option<String>,
    pub weather_account_key: String,
    pub weather_security_key: String,
    pub forecast_url: Option<String>,
}

impl LakeConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("ENERLAKE_DATA_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| std::path::PathBuf::from("./lake-data")),
            scheduler_enabled: std::env::var("ENERLAKE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            rebuild_cron: std::env::var("ENERLAKE_REBUILD_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            weather_base_url: std::env::var("DEGREEDAYS_BASE_URL").ok(),
            weather_account_key: std::env::var("DEGREEDAYS_ACCOUNT_KEY").unwrap_or_default(),
            weather_security_key: std::env::var("DEGREEDAYS_SECURITY_KEY").unwrap_or_default(),
            forecast_url: std::env::var("RUN_ALGO_URL").ok(),
        }
    }
}

/// Optional cron job rebuilding every silver table, sharing the per-entity
/// locks with the request-triggered rebuilds.
pub async fn maybe_build_scheduler(
    lake: Arc<Lake>,
    config: &LakeConfig,
) -> Result<Option<JobScheduler>, PipelineError> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| PipelineError::Scheduler(e.to_string()))?;
    let job = Job::new_async(config.rebuild_cron.as_str(), move |_uuid, _lock| {
        let lake = Arc::clone(&lake);
        Box::pin(async move {
            for spec in all_specs() {
                if let Err(err) = lake.rebuild(spec).await {
                    warn!(entity = spec.entity, %err, "scheduled silver rebuild failed");
                }
            }
        })
    })
    .map_err(|e| PipelineError::Scheduler(e.to_string()))?;
    scheduler
        .add(job)
        .await
        .map_err(|e| PipelineError::Scheduler(e.to_string()))?;
    Ok(Some(scheduler))
}
