//! Tests for per-batch accumulation.

use anyhow::Result;
use spectral_ingest::accumulate::BatchAccumulator;
use spectral_ingest::batch::Batch;
use spectral_ingest::config::Parallelism;
use spectral_ingest::locate::Candidate;
use spectral_ingest::logging::{LogLevel, RunLog};
use spectral_ingest::record::{Column, Matrix, MetaValue, MetadataRecord, Payload, ProcessedRecord};
use spectral_ingest::store::BatchPayload;
use spectral_ingest::testing::{Script, ScriptedProcessor};

fn batch(keys: &[&str]) -> Batch {
    Batch {
        label: "batch 1 of 1".into(),
        group: String::new(),
        items: keys
            .iter()
            .map(|k| Candidate::new(*k, format!("/in/{k}.dat")))
            .collect(),
    }
}

fn record(key: &str, rows: &[Vec<f64>]) -> ProcessedRecord {
    let n = rows.len();
    ProcessedRecord::new(
        Payload::Vector(Matrix::from_rows(rows).unwrap()),
        MetadataRecord::new()
            .with("id", (0..n).map(|_| key).collect::<MetaValue>())
            .with("value", (0..n).map(|_| 1.0).collect::<MetaValue>()),
    )
}

#[test]
fn test_rows_and_metadata_stay_aligned() -> Result<()> {
    let processor = ScriptedProcessor::vector(3)
        .with_script("A", Script::Shots(5))
        .with_script("B", Script::Shots(3));
    let log = RunLog::capturing("t");
    let acc = BatchAccumulator::new(&processor, &log);

    let out = acc.accumulate(&batch(&["A", "B"]))?.expect("batch has records");
    assert_eq!(out.records, 2);
    assert_eq!(out.skipped, 0);
    assert_eq!(out.rows(), 8);
    assert_eq!(out.metadata.row_count(), 8);
    assert_eq!(
        out.metadata.keys("id").unwrap(),
        vec!["A", "A", "A", "A", "A", "B", "B", "B"]
    );
    let BatchPayload::Rows(m) = &out.payload else {
        panic!("expected vector rows");
    };
    assert_eq!(m.channels(), 3);
    Ok(())
}

#[test]
fn test_failures_are_logged_and_skipped() -> Result<()> {
    let processor = ScriptedProcessor::vector(2)
        .with_script("bad", Script::Fail("truncated file".into()))
        .with_script("empty", Script::Skip);
    let log = RunLog::capturing("t");
    let acc = BatchAccumulator::new(&processor, &log);

    let out = acc
        .accumulate(&batch(&["a", "bad", "b", "empty"]))?
        .expect("two records survive");
    assert_eq!((out.records, out.skipped), (2, 2));
    assert_eq!(out.metadata.keys("id").unwrap(), vec!["a", "b"]);
    assert_eq!(log.warning_count(), 2);
    assert!(log.contains("skipping record bad (/in/bad.dat): unparseable input: truncated file"));
    assert!(log.contains("processor returned no record"));
    Ok(())
}

#[test]
fn test_shape_mismatches_are_record_failures() -> Result<()> {
    // Three rows but two keys.
    let short_keys = ProcessedRecord::new(
        Payload::Vector(Matrix::from_flat(2, vec![0.0; 6])?),
        MetadataRecord::new().with("id", ["x", "x"].into_iter().collect::<MetaValue>()),
    );
    // Wrong row width for the layout.
    let narrow = record("w", &[vec![1.0]]);
    // No primary key at all.
    let keyless = ProcessedRecord::new(
        Payload::Vector(Matrix::from_flat(2, vec![0.0; 2])?),
        MetadataRecord::new().with("other", 1_i64),
    );
    // Trajectories in a vector batch.
    let wrong_kind = ProcessedRecord::new(
        Payload::Trajectories(vec![]),
        MetadataRecord::new().with("id", "t"),
    );

    let processor = ScriptedProcessor::vector(2)
        .with_script("x", Script::Record(short_keys))
        .with_script("w", Script::Record(narrow))
        .with_script("k", Script::Record(keyless))
        .with_script("t", Script::Record(wrong_kind));
    let log = RunLog::capturing("t");
    let acc = BatchAccumulator::new(&processor, &log);

    let out = acc
        .accumulate(&batch(&["x", "ok", "w", "k", "t"]))?
        .expect("one record survives");
    assert_eq!((out.records, out.skipped), (1, 4));
    assert_eq!(out.rows(), 1);
    assert!(log.contains("missing primary-key field 'id'"));
    Ok(())
}

#[test]
fn test_inconsistent_metadata_schema_is_skipped() -> Result<()> {
    let odd = ProcessedRecord::new(
        Payload::Vector(Matrix::from_flat(2, vec![0.0; 2])?),
        MetadataRecord::new().with("id", "odd").with("value", "text"),
    );
    let processor = ScriptedProcessor::vector(2).with_script("odd", Script::Record(odd));
    let log = RunLog::capturing("t");
    let out = BatchAccumulator::new(&processor, &log)
        .accumulate(&batch(&["first", "odd"]))?
        .expect("first record survives");
    assert_eq!((out.records, out.skipped), (1, 1));
    assert_eq!(out.metadata.column("value").map(Column::len), Some(1));
    Ok(())
}

#[test]
fn test_all_failures_write_nothing() -> Result<()> {
    let processor = ScriptedProcessor::vector(2)
        .with_script("a", Script::Fail("x".into()))
        .with_script("b", Script::Skip);
    let log = RunLog::capturing("t");
    let out = BatchAccumulator::new(&processor, &log).accumulate(&batch(&["a", "b"]))?;
    assert!(out.is_none());
    assert_eq!(log.error_count(), 1);
    let errors: Vec<_> = log
        .entries()
        .into_iter()
        .filter(|e| e.level == LogLevel::Error)
        .collect();
    assert_eq!(
        errors[0].message,
        "batch 1 of 1: none of 2 records could be processed; nothing written"
    );
    Ok(())
}

#[test]
fn test_trajectory_batches() -> Result<()> {
    let processor = ScriptedProcessor::trajectory().with_script("multi", Script::Shots(3));
    let log = RunLog::capturing("t");
    let out = BatchAccumulator::new(&processor, &log)
        .accumulate(&batch(&["one", "multi"]))?
        .expect("records survive");
    let BatchPayload::Trajectories(t) = &out.payload else {
        panic!("expected trajectories");
    };
    assert_eq!(t.len(), 4);
    assert_eq!(out.metadata.keys("id").unwrap(), vec!["one", "multi", "multi", "multi"]);
    Ok(())
}

#[test]
fn test_parallel_preserves_batch_order() -> Result<()> {
    let keys: Vec<String> = (0..40).map(|i| format!("k{i:02}")).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let mut processor = ScriptedProcessor::vector(4);
    for (i, k) in keys.iter().enumerate() {
        processor = processor.with_script(k.clone(), Script::Shots(1 + i % 3));
    }
    let counters = processor.counters();
    let log = RunLog::capturing("t");

    let sequential = BatchAccumulator::new(&processor, &log).accumulate(&batch(&refs))?;
    let parallel = BatchAccumulator::new(&processor, &log)
        .with_parallelism(Parallelism::Parallel { threads: Some(4) })
        .accumulate(&batch(&refs))?;
    assert_eq!(sequential, parallel);
    assert_eq!(counters.processed(), 80);
    Ok(())
}
