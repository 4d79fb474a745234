//! Tests for the append-only vector archive.

use anyhow::Result;
use spectral_ingest::config::Driver;
use spectral_ingest::error::IngestError;
use spectral_ingest::logging::RunLog;
use spectral_ingest::record::Matrix;
use spectral_ingest::store::VectorStore;
use spectral_ingest::store::vector::HEADER_LEN;
use std::fs::{OpenOptions, metadata};
use std::io::Write;
use tempfile::TempDir;

fn rows(n: usize, channels: usize, base: f64) -> Matrix {
    #[allow(clippy::cast_precision_loss)]
    let data = (0..n * channels).map(|i| base + i as f64).collect();
    Matrix::from_flat(channels, data).unwrap()
}

#[test]
fn test_append_and_read_back() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 4, Driver::Single);
    assert_eq!(store.row_count()?, 0);
    assert!(store.segments().is_empty());

    store.append(&rows(3, 4, 0.0))?;
    store.append(&rows(2, 4, 100.0))?;
    assert_eq!(store.row_count()?, 5);
    assert_eq!(store.segments(), vec![tmp.path().join("out.spectra")]);

    let all = store.read_all()?;
    assert_eq!(all.rows(), 5);
    assert_eq!(all.row(0), &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(all.row(3), &[100.0, 101.0, 102.0, 103.0]);

    let tail = store.read_rows(4, 1)?;
    assert_eq!(tail.row(0), &[104.0, 105.0, 106.0, 107.0]);
    assert!(store.read_rows(4, 2).is_err());

    let len = metadata(tmp.path().join("out.spectra"))?.len();
    assert_eq!(len, HEADER_LEN + 5 * 4 * 8);
    Ok(())
}

#[test]
fn test_existing_rows_are_never_modified() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 2, Driver::Single);
    store.append(&rows(2, 2, 0.0))?;
    let before = store.read_rows(0, 2)?;
    store.append(&rows(10, 2, 50.0))?;
    assert_eq!(store.read_rows(0, 2)?, before);
    Ok(())
}

#[test]
fn test_channel_mismatch_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 4, Driver::Single);
    store.append(&rows(1, 4, 0.0))?;

    let err = store.append(&rows(1, 3, 0.0)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::ChannelMismatch { archive: 4, batch: 3, .. })
    ));

    // Reopening with the wrong width is caught from the header.
    let wrong = VectorStore::new(tmp.path().join("out"), 8, Driver::Single);
    let err = wrong.row_count().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::ChannelMismatch { archive: 4, batch: 8, .. })
    ));
    assert_eq!(store.row_count()?, 1);
    Ok(())
}

#[test]
fn test_family_driver_splits_segments() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("fam"), 2, Driver::Family { segment_rows: 4 });
    store.append(&rows(3, 2, 0.0))?;
    store.append(&rows(6, 2, 10.0))?;

    let segments = store.segments();
    assert_eq!(
        segments,
        vec![
            tmp.path().join("fam.000.spectra"),
            tmp.path().join("fam.001.spectra"),
            tmp.path().join("fam.002.spectra"),
        ]
    );
    assert_eq!(store.row_count()?, 9);

    let all = store.read_all()?;
    assert_eq!(all.row(3), &[10.0, 11.0]);
    assert_eq!(all.row(8), &[20.0, 21.0]);
    Ok(())
}

#[test]
fn test_torn_tail_is_ignored() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 2, Driver::Single);
    store.append(&rows(2, 2, 0.0))?;

    // Bytes past the committed rows, as left by a crash before the header update.
    let mut f = OpenOptions::new().append(true).open(tmp.path().join("out.spectra"))?;
    f.write_all(&[0xAB; 13])?;
    drop(f);

    assert_eq!(store.row_count()?, 2);
    store.append(&rows(1, 2, 7.0))?;
    assert_eq!(store.read_all()?.row(2), &[7.0, 8.0]);
    Ok(())
}

#[test]
fn test_reconcile_drops_uncommitted_tail() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("fam"), 1, Driver::Family { segment_rows: 2 });
    store.append(&rows(5, 1, 0.0))?;
    let log = RunLog::capturing("t");

    store.reconcile(5, &log)?;
    assert_eq!(log.warning_count(), 0);

    store.reconcile(1, &log)?;
    assert_eq!(store.row_count()?, 1);
    assert_eq!(store.segments().len(), 1);
    assert_eq!(log.warning_count(), 1);
    assert!(log.contains("dropping 4 uncommitted rows"));

    store.append(&rows(1, 1, 9.0))?;
    assert_eq!(store.read_all()?.as_slice(), &[0.0, 9.0]);
    Ok(())
}

#[test]
fn test_reconcile_short_archive_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 1, Driver::Single);
    store.append(&rows(2, 1, 0.0))?;
    let err = store.reconcile(3, &RunLog::capturing("t")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::ArchiveOutOfSync {
            archive_rows: 2,
            meta_rows: 3
        })
    ));
    Ok(())
}

#[test]
fn test_bad_magic_is_corrupt() -> Result<()> {
    let tmp = TempDir::new()?;
    std::fs::write(tmp.path().join("out.spectra"), vec![0u8; 64])?;
    let store = VectorStore::new(tmp.path().join("out"), 1, Driver::Single);
    let err = store.row_count().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::CorruptArchive { .. })
    ));
    Ok(())
}

#[test]
fn test_overflowing_row_count_is_corrupt() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = VectorStore::new(tmp.path().join("out"), 4, Driver::Single);
    store.append(&rows(2, 4, 0.0))?;

    let path = tmp.path().join("out.spectra");
    let mut bytes = std::fs::read(&path)?;
    bytes[24..32].copy_from_slice(&(u64::MAX / 4).to_le_bytes());
    std::fs::write(&path, &bytes)?;

    for err in [
        store.row_count().unwrap_err(),
        store.read_rows(0, 1).unwrap_err(),
        store.reconcile(2, &RunLog::capturing("t")).unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::CorruptArchive { .. })
        ));
    }
    Ok(())
}
