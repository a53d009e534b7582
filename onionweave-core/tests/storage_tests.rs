// Tests for the storage connector, death records and the metric store

use chrono::{Duration, TimeZone, Utc};
use onionweave_core::death::{DeathNotice, DeathRecord};
use onionweave_core::error::PipelineError;
use onionweave_core::metrics::{MetricRequest, MetricSink, MetricStore, NoopMetrics, Sample};
use onionweave_core::storage::Storage;
use rusqlite::params;
use std::fs;
use tempfile::TempDir;

fn create_test_storage() -> (TempDir, Storage) {
    let temp_dir = TempDir::new().unwrap();
    let storage = Storage::new(&temp_dir.path().join("test.db"));
    (temp_dir, storage)
}

// ============================================================================
// Storage Tests
// ============================================================================

#[test]
fn test_storage_opens_lazily() {
    let (temp_dir, mut storage) = create_test_storage();
    let db_path = temp_dir.path().join("test.db");

    assert!(!storage.is_open());
    assert!(!Storage::exists(&db_path));

    storage.connection().unwrap();
    assert!(storage.is_open());
    assert!(Storage::exists(&db_path));
}

#[test]
fn test_storage_creates_parent_directories() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("dir").join("test.db");
    let mut storage = Storage::new(&db_path);

    storage.connection().unwrap();
    assert!(db_path.exists());
}

#[test]
fn test_ensure_schema_applies_once() {
    let (_temp_dir, mut storage) = create_test_storage();
    let schema = "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);";

    assert!(storage.ensure_schema("item", schema).unwrap());
    assert!(!storage.ensure_schema("item", schema).unwrap());
}

#[test]
fn test_with_cursor_commits_on_success() {
    let (_temp_dir, mut storage) = create_test_storage();
    storage
        .ensure_schema("item", "CREATE TABLE item (name TEXT);")
        .unwrap();

    storage
        .with_cursor(|tx| {
            tx.execute("INSERT INTO item (name) VALUES (?1)", params!["kept"])?;
            Ok(())
        })
        .unwrap();

    let count: i64 = storage
        .with_cursor(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM item", [], |r| r.get(0))?))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_with_cursor_rolls_back_on_error() {
    let (_temp_dir, mut storage) = create_test_storage();
    storage
        .ensure_schema("item", "CREATE TABLE item (name TEXT);")
        .unwrap();

    let result: Result<(), PipelineError> = storage.with_cursor(|tx| {
        tx.execute("INSERT INTO item (name) VALUES (?1)", params!["lost"])?;
        Err(PipelineError::InvalidRequest("abort".to_string()))
    });
    assert!(result.is_err());

    let count: i64 = storage
        .with_cursor(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM item", [], |r| r.get(0))?))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn test_storage_drop() {
    let (temp_dir, mut storage) = create_test_storage();
    let db_path = temp_dir.path().join("test.db");
    storage.connection().unwrap();
    drop(storage);

    Storage::drop(&db_path).unwrap();
    assert!(!Storage::exists(&db_path));
}

// ============================================================================
// Death Record Tests
// ============================================================================

#[test]
fn test_death_record_roundtrip_and_consume() {
    let temp_dir = TempDir::new().unwrap();
    let notice = DeathNotice::new(temp_dir.path(), 4242);

    assert!(!DeathRecord::exists(temp_dir.path(), 4242));
    notice
        .announce(false, Some("handler exploded".to_string()))
        .unwrap();
    assert!(DeathRecord::exists(temp_dir.path(), 4242));

    let record = DeathRecord::consume(temp_dir.path(), 4242).unwrap().unwrap();
    assert!(!record.success);
    assert_eq!(record.message.as_deref(), Some("handler exploded"));
    assert!(!DeathRecord::exists(temp_dir.path(), 4242));
    assert!(DeathRecord::consume(temp_dir.path(), 4242).unwrap().is_none());
}

#[test]
fn test_death_record_wire_format() {
    let temp_dir = TempDir::new().unwrap();
    DeathRecord::new(true, None).write(temp_dir.path(), 7).unwrap();

    let raw = fs::read_to_string(temp_dir.path().join("7")).unwrap();
    assert_eq!(raw, r#"{"success":true}"#);
}

#[test]
fn test_unreadable_death_record_counts_as_failure() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("9"), "garbage").unwrap();

    let record = DeathRecord::consume(temp_dir.path(), 9).unwrap().unwrap();
    assert!(!record.success);
    assert!(!temp_dir.path().join("9").exists());
}

// ============================================================================
// Metric Store Tests
// ============================================================================

#[test]
fn test_declare_is_idempotent() {
    let (_temp_dir, storage) = create_test_storage();
    let mut store = MetricStore::new(storage).unwrap();

    let first = store.declare("Fetcher", &["processed", "failed"]).unwrap();
    let second = store.declare("Fetcher", &["processed", "failed"]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(store.list().unwrap().len(), 2);
}

#[test]
fn test_send_and_query_window() {
    let (_temp_dir, storage) = create_test_storage();
    let mut store = MetricStore::new(storage).unwrap();
    let ids = store.declare("Extractor", &["processed"]).unwrap();
    let id = ids["processed"];

    let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let samples: Vec<Sample> = (0..5)
        .map(|i| Sample {
            metric_id: id,
            timestamp: base + Duration::minutes(i),
            value: i,
        })
        .collect();
    store.send(&samples).unwrap();

    let points = store
        .query(id, base + Duration::minutes(1), base + Duration::minutes(3))
        .unwrap();
    let values: Vec<i64> = points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn test_dispatch_validates_requests() {
    let (_temp_dir, storage) = create_test_storage();
    let mut store = MetricStore::new(storage).unwrap();

    let declared = store
        .dispatch(
            MetricRequest::parse(r#"{"op":"declare","stage":"Frontier","metrics":["ticks"]}"#)
                .unwrap(),
        )
        .unwrap();
    assert!(declared["ticks"].is_i64());

    let listed = store
        .dispatch(MetricRequest::parse(r#"{"op":"list"}"#).unwrap())
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    assert!(matches!(
        MetricRequest::parse(r#"{"op":"drop_tables"}"#),
        Err(PipelineError::InvalidRequest(_))
    ));
    assert!(matches!(
        MetricRequest::parse(r#"{"op":"send","values":[],"extra":1}"#),
        Err(PipelineError::InvalidRequest(_))
    ));
}

#[test]
fn test_noop_metrics_accepts_everything() {
    let mut sink = NoopMetrics;
    let ids = sink.declare("Any", &["a", "b"]).unwrap();
    assert_eq!(ids.len(), 2);
    sink.send(&[]).unwrap();
}
