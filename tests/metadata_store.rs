//! Tests for the parquet metadata side-store and the dedup index built on it.

use anyhow::Result;
use arrow::array::{ArrayRef, BinaryArray, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use spectral_ingest::error::IngestError;
use spectral_ingest::logging::RunLog;
use spectral_ingest::processed::{ProcessedIndex, load_processed};
use spectral_ingest::record::{Column, ColumnarTable, MetaValue, MetadataRecord};
use spectral_ingest::store::MetadataStore;
use std::fs::{File, read_dir, write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn batch(keys: &[(&str, usize)]) -> ColumnarTable {
    let mut table = ColumnarTable::new();
    for (key, n) in keys {
        let rec = MetadataRecord::new()
            .with("id", (0..*n).map(|_| *key).collect::<MetaValue>())
            .with("shot", (0_i64..).take(*n).collect::<MetaValue>())
            .with("ok", true);
        table.push_record(&rec, *n);
    }
    table
}

#[test]
fn test_missing_store_is_empty() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = MetadataStore::new(tmp.path().join("x_meta.parquet"));
    assert!(!store.exists());
    assert!(store.load()?.is_empty());
    assert_eq!(store.row_count()?, 0);

    let log = RunLog::capturing("t");
    let index = load_processed(store.path(), "id", &log)?;
    assert!(index.is_empty());
    assert!(log.contains("No previous output file"));
    Ok(())
}

#[test]
fn test_append_concatenates_old_first() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = MetadataStore::new(tmp.path().join("x_meta.parquet"));

    assert_eq!(store.append(&batch(&[("A", 2)]))?, 2);
    assert_eq!(store.append(&batch(&[("B", 1), ("C", 2)]))?, 5);

    let table = store.load()?;
    assert_eq!(table.keys("id").unwrap(), vec!["A", "A", "B", "C", "C"]);
    assert_eq!(table.column("shot"), Some(&Column::Int(vec![0, 1, 0, 0, 1])));
    assert_eq!(table.column("ok"), Some(&Column::Bool(vec![true; 5])));
    assert_eq!(store.row_count()?, 5);

    let index = ProcessedIndex::load(store.path(), "id")?;
    assert_eq!(index.len(), 3);
    assert_eq!(index.rows(), 5);
    assert!(index.contains("B"));
    Ok(())
}

#[test]
fn test_stage_detects_schema_conflict_without_writing() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = MetadataStore::new(tmp.path().join("x_meta.parquet"));
    store.append(&batch(&[("A", 1)]))?;

    let mut other = ColumnarTable::new();
    other.push_record(&MetadataRecord::new().with("id", "Z").with("shot", 0_i64), 1);
    let err = store.stage(&other).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::SchemaMismatch { .. })
    ));
    assert_eq!(store.row_count()?, 1);
    Ok(())
}

#[test]
fn test_persist_leaves_no_temp_files() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = MetadataStore::new(tmp.path().join("x_meta.parquet"));
    for k in ["A", "B", "C"] {
        store.append(&batch(&[(k, 1)]))?;
    }
    let names: Vec<_> = read_dir(tmp.path())?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<Result<_, _>>()?;
    assert_eq!(names.len(), 1);
    Ok(())
}

#[test]
fn test_corrupt_store_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("x_meta.parquet");
    write(&path, b"definitely not parquet")?;

    let err = ProcessedIndex::load(&path, "id").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::CorruptSideStore { .. })
    ));
    assert!(MetadataStore::new(&path).load().is_err());
    Ok(())
}

#[test]
fn test_missing_key_column_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = MetadataStore::new(tmp.path().join("x_meta.parquet"));
    store.append(&batch(&[("A", 1)]))?;
    let err = ProcessedIndex::load(store.path(), "sample_id").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::CorruptSideStore { .. })
    ));
    Ok(())
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let mut writer = ArrowWriter::try_new(File::create(path)?, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_binary_and_integer_keys_are_decoded() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("x_meta.parquet");
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Binary, false),
        Field::new("num", DataType::Int64, false),
    ]));
    let ids: ArrayRef = Arc::new(BinaryArray::from_vec(vec![b"CL5_001".as_slice(), b"CL5_002".as_slice()]));
    let nums: ArrayRef = Arc::new(Int64Array::from(vec![7, 8]));
    write_batch(&path, &RecordBatch::try_new(schema, vec![ids, nums])?)?;

    let by_id = ProcessedIndex::load(&path, "id")?;
    assert!(by_id.contains("CL5_001") && by_id.contains("CL5_002"));

    let by_num = ProcessedIndex::load(&path, "num")?;
    assert!(by_num.contains("7"));

    let normalized = by_id.normalized(|k| k.rsplit_once('_').map(|(p, _)| p.to_string()));
    assert_eq!(normalized.len(), 1);
    assert!(normalized.contains("CL5"));

    // Binary columns load back as text.
    let table = MetadataStore::new(&path).load()?;
    assert_eq!(table.keys("id").unwrap(), vec!["CL5_001", "CL5_002"]);
    Ok(())
}
