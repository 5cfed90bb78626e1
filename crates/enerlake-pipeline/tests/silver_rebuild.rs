use std::sync::Arc;

use enerlake_pipeline::{Lake, BUILDING, INVOICE};
use enerlake_storage::{BlobStore, LocalBlobStore};
use serde_json::json;
use tempfile::tempdir;

fn lake_in(dir: &tempfile::TempDir) -> Arc<Lake> {
    Arc::new(Lake::new(Arc::new(LocalBlobStore::new(dir.path()))))
}

#[tokio::test]
async fn rebuild_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    for idx in 1..=3u32 {
        lake.write_bronze(
            "building",
            &format!("building_{idx:06}.json"),
            &json!({
                "id_building_primaire": format!("building_{idx:06}"),
                "name": format!("site {idx}"),
                "received_at": "2024-01-01T00:00:00Z"
            }),
        )
        .await
        .expect("write bronze");
    }

    let first = lake.rebuild(&BUILDING).await.expect("first rebuild");
    let rows_after_first = lake.all_rows(&BUILDING).await.expect("rows");
    let second = lake.rebuild(&BUILDING).await.expect("second rebuild");
    let rows_after_second = lake.all_rows(&BUILDING).await.expect("rows");

    assert_eq!(first, 3);
    assert_eq!(second, 3);
    assert_eq!(rows_after_first, rows_after_second);
}

#[tokio::test]
async fn dedup_prefers_the_latest_received_at() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    lake.write_bronze(
        "building",
        "building_000001.json",
        &json!({
            "id_building_primaire": "building_000001",
            "name": "original",
            "received_at": "2024-01-01T00:00:00Z"
        }),
    )
    .await
    .expect("write");
    // Same business key from a later capture under a different file name.
    lake.write_bronze(
        "building",
        "building_000001_resent.json",
        &json!({
            "id_building_primaire": "building_000001",
            "name": "corrected",
            "received_at": "2024-03-01T00:00:00Z"
        }),
    )
    .await
    .expect("write");

    let count = lake.rebuild(&BUILDING).await.expect("rebuild");
    assert_eq!(count, 1);
    let rows = lake.all_rows(&BUILDING).await.expect("rows");
    assert_eq!(rows[0]["name"], json!("corrected"));
}

#[tokio::test]
async fn malformed_bronze_documents_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(LocalBlobStore::new(dir.path()));
    let lake = Arc::new(Lake::new(Arc::clone(&store) as Arc<dyn BlobStore>));

    lake.write_bronze(
        "building",
        "building_000001.json",
        &json!({
            "id_building_primaire": "building_000001",
            "name": "healthy",
            "received_at": "2024-01-01T00:00:00Z"
        }),
    )
    .await
    .expect("write");
    store
        .put("bronze/building/building_000002.json", b"{not json at all")
        .await
        .expect("write corrupt blob");

    let count = lake.rebuild(&BUILDING).await.expect("rebuild");
    assert_eq!(count, 1);
    let rows = lake.all_rows(&BUILDING).await.expect("rows");
    assert_eq!(rows[0]["id_building_primaire"], json!("building_000001"));
}

#[tokio::test]
async fn out_of_range_coordinates_become_null_in_silver() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    lake.write_bronze(
        "building",
        "building_000001.json",
        &json!({
            "id_building_primaire": "building_000001",
            "latitude": 140.0,
            "longitude": 5.37,
            "received_at": "2024-01-01T00:00:00Z"
        }),
    )
    .await
    .expect("write");

    lake.rebuild(&BUILDING).await.expect("rebuild");
    let rows = lake.all_rows(&BUILDING).await.expect("rows");
    assert!(rows[0]["latitude"].is_null());
    assert_eq!(rows[0]["longitude"], json!(5.37));
}

#[tokio::test]
async fn empty_bronze_writes_no_snapshot() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    let count = lake.rebuild(&BUILDING).await.expect("rebuild");
    assert_eq!(count, 0);
    assert!(lake
        .store()
        .get("silver/building/building.parquet")
        .await
        .expect("get")
        .is_none());
    assert!(lake.all_rows(&BUILDING).await.expect("rows").is_empty());
}

#[tokio::test]
async fn batch_envelope_explodes_and_inherits_timestamp() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    let items: Vec<_> = (1..=5u32)
        .map(|idx| {
            let mut item = json!({
                "invoice_id_primaire": format!("invoice_000001_001_{idx:02}"),
                "deliverypoint_id_primaire": "deliverypoint_000001_001",
                "value": idx as f64 * 10.0,
            });
            if idx != 3 {
                item["received_at"] = json!("2024-05-02T00:00:00Z");
            }
            item
        })
        .collect();
    lake.write_bronze(
        "invoice",
        "invoice_batch_20240501_120000_abcd1234.json",
        &json!({
            "batch_id": "invoice_batch_20240501_120000_abcd1234",
            "received_at": "2024-05-01T12:00:00Z",
            "items": items,
        }),
    )
    .await
    .expect("write batch");

    let count = lake.rebuild(&INVOICE).await.expect("rebuild");
    assert_eq!(count, 5);

    let rows = lake.all_rows(&INVOICE).await.expect("rows");
    let third = rows
        .iter()
        .find(|r| r["invoice_id_primaire"] == json!("invoice_000001_001_03"))
        .expect("third invoice");
    assert_eq!(third["received_at"], json!("2024-05-01T12:00:00Z"));
}

#[tokio::test]
async fn update_row_patches_silver_in_place() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    lake.write_bronze(
        "building",
        "building_000001.json",
        &json!({
            "id_building_primaire": "building_000001",
            "name": "before",
            "surface": 100.0,
            "received_at": "2024-01-01T00:00:00Z"
        }),
    )
    .await
    .expect("write");
    lake.rebuild(&BUILDING).await.expect("rebuild");

    let mut patch = serde_json::Map::new();
    patch.insert("name".into(), json!("after"));
    patch.insert("received_at".into(), json!("2024-02-01T00:00:00Z"));
    let updated = lake
        .update_row(&BUILDING, "building_000001", &patch)
        .await
        .expect("update");
    assert!(updated);

    let row = lake
        .find_row(&BUILDING, "building_000001")
        .await
        .expect("find")
        .expect("row");
    assert_eq!(row["name"], json!("after"));
    assert_eq!(row["surface"], json!(100.0));
    assert_eq!(row["received_at"], json!("2024-02-01T00:00:00Z"));

    let missing = lake
        .update_row(&BUILDING, "building_999999", &patch)
        .await
        .expect("update missing");
    assert!(!missing);
}

#[tokio::test]
async fn id_generation_scans_existing_artifacts() {
    let dir = tempdir().expect("tempdir");
    let lake = lake_in(&dir);

    assert_eq!(lake.next_building_index().await.expect("scan"), 1);

    lake.write_bronze("building", "building_000001.json", &json!({}))
        .await
        .expect("write");
    lake.write_bronze("building", "building_000007.json", &json!({}))
        .await
        .expect("write");
    assert_eq!(lake.next_building_index().await.expect("scan"), 8);

    lake.write_bronze("deliverypoint", "deliverypoint_000007_002.json", &json!({}))
        .await
        .expect("write");
    assert_eq!(
        lake.next_deliverypoint_index("000007").await.expect("scan"),
        3
    );
    assert_eq!(
        lake.next_deliverypoint_index("000001").await.expect("scan"),
        1
    );
}
