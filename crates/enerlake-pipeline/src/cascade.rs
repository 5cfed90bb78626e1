//! Cascading deletes over the silver tables.
//!
//! A building delete removes its invoices, then its delivery points, then its
//! usage data, then the building itself, reporting how far it got. There is
//! no compensation: a failure mid-cascade leaves the earlier steps applied
//! and names them in the error.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{Lake, PipelineError, Row, BUILDING, DELIVERYPOINT, INVOICE, USAGE_DATA};

#[derive(Debug, Default, Clone, Serialize)]
pub struct CascadeReport {
    pub invoices_deleted: usize,
    pub deliverypoints_deleted: usize,
    pub usage_data_deleted: usize,
    /// Steps that ran to completion, in execution order.
    pub completed_steps: Vec<&'static str>,
}

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    /// The cascade stopped partway; `report` lists what was already applied.
    #[error("cascade aborted after {} step(s): {source}", report.completed_steps.len())]
    Aborted {
        report: CascadeReport,
        #[source]
        source: PipelineError,
    },
}

fn step(report: &CascadeReport, source: PipelineError) -> CascadeError {
    CascadeError::Aborted { report: report.clone(), source }
}

fn id_of(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(|v| v.as_str()).map(str::to_string)
}

async fn remove_silver_and_bronze(
    lake: &Lake,
    spec: &'static crate::TableSpec,
    ids: &[String],
    delete_bronze: bool,
) -> Result<usize, PipelineError> {
    let mut removed = 0;
    for id in ids {
        removed += lake
            .remove_rows(spec, spec.id_column, id)
            .await?
            .unwrap_or(0);
        if delete_bronze {
            lake.delete_bronze(spec.entity, &format!("{id}.json")).await?;
        }
    }
    Ok(removed)
}

async fn invoice_ids_for_deliverypoints(
    lake: &Lake,
    dp_ids: &[String],
) -> Result<Vec<String>, PipelineError> {
    let rows = lake.all_rows(&INVOICE).await?;
    Ok(rows
        .iter()
        .filter(|row| {
            row.get("deliverypoint_id_primaire")
                .and_then(|v| v.as_str())
                .is_some_and(|dp| dp_ids.iter().any(|id| id == dp))
        })
        .filter_map(|row| id_of(row, INVOICE.id_column))
        .collect())
}

/// Deletes a building and everything hanging off it. Bronze documents are
/// removed best-effort alongside the silver rows; invoice rows that came in
/// through batch envelopes only exist in silver.
pub async fn delete_building(lake: &Lake, building_id: &str) -> Result<CascadeReport, CascadeError> {
    let exists = lake
        .row_exists(&BUILDING, building_id)
        .await
        .map_err(|source| CascadeError::Aborted { report: CascadeReport::default(), source })?;
    if !exists {
        return Err(CascadeError::NotFound {
            entity: BUILDING.entity,
            id: building_id.to_string(),
        });
    }

    let mut report = CascadeReport::default();

    let dp_ids: Vec<String> = lake
        .rows_where(&DELIVERYPOINT, "id_building_primaire", building_id)
        .await
        .map_err(|e| step(&report, e))?
        .iter()
        .filter_map(|row| id_of(row, DELIVERYPOINT.id_column))
        .collect();

    let invoice_ids = invoice_ids_for_deliverypoints(lake, &dp_ids)
        .await
        .map_err(|e| step(&report, e))?;
    report.invoices_deleted = remove_silver_and_bronze(lake, &INVOICE, &invoice_ids, true)
        .await
        .map_err(|e| step(&report, e))?;
    report.completed_steps.push("invoices");

    report.deliverypoints_deleted = remove_silver_and_bronze(lake, &DELIVERYPOINT, &dp_ids, true)
        .await
        .map_err(|e| step(&report, e))?;
    report.completed_steps.push("deliverypoints");

    let usage_ids: Vec<String> = lake
        .rows_where(&USAGE_DATA, "id_building_primaire", building_id)
        .await
        .map_err(|e| step(&report, e))?
        .iter()
        .filter_map(|row| id_of(row, USAGE_DATA.id_column))
        .collect();
    report.usage_data_deleted = remove_silver_and_bronze(lake, &USAGE_DATA, &usage_ids, true)
        .await
        .map_err(|e| step(&report, e))?;
    report.completed_steps.push("usage_data");

    remove_silver_and_bronze(lake, &BUILDING, &[building_id.to_string()], true)
        .await
        .map_err(|e| step(&report, e))?;
    report.completed_steps.push("building");

    info!(
        building = building_id,
        invoices = report.invoices_deleted,
        deliverypoints = report.deliverypoints_deleted,
        usage_data = report.usage_data_deleted,
        "cascade delete completed"
    );
    Ok(report)
}

/// Deletes a delivery point and its invoices.
pub async fn delete_deliverypoint(lake: &Lake, dp_id: &str) -> Result<CascadeReport, CascadeError> {
    let exists = lake
        .row_exists(&DELIVERYPOINT, dp_id)
        .await
        .map_err(|source| CascadeError::Aborted { report: CascadeReport::default(), source })?;
    if !exists {
        return Err(CascadeError::NotFound {
            entity: DELIVERYPOINT.entity,
            id: dp_id.to_string(),
        });
    }

    let mut report = CascadeReport::default();

    let invoice_ids = invoice_ids_for_deliverypoints(lake, &[dp_id.to_string()])
        .await
        .map_err(|e| step(&report, e))?;
    report.invoices_deleted = remove_silver_and_bronze(lake, &INVOICE, &invoice_ids, true)
        .await
        .map_err(|e| step(&report, e))?;
    report.completed_steps.push("invoices");

    report.deliverypoints_deleted =
        remove_silver_and_bronze(lake, &DELIVERYPOINT, &[dp_id.to_string()], true)
            .await
            .map_err(|e| step(&report, e))?;
    report.completed_steps.push("deliverypoint");

    Ok(report)
}
