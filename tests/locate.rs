//! Tests for input discovery.

use anyhow::Result;
use spectral_ingest::locate::{FLAT_GROUP, RecordLocator, candidate_count, locate};
use spectral_ingest::logging::RunLog;
use spectral_ingest::testing::write_raw_file;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn stem(name: &str) -> Option<String> {
    let (stem, _) = name.rsplit_once('.')?;
    (!stem.starts_with('_')).then(|| stem.to_string())
}

fn tree(root: &Path) -> Result<Vec<PathBuf>> {
    let a = root.join("run_a");
    let b = root.join("run_b");
    write_raw_file(&a, "s1.csv", "1")?;
    write_raw_file(&a, "S2.CSV", "1")?;
    write_raw_file(&a, "nested/deep/s3.csv", "1")?;
    write_raw_file(&a, "notes.txt", "x")?;
    write_raw_file(&a, "_broken.csv", "1")?;
    write_raw_file(&b, "s4.csv", "1")?;
    write_raw_file(&b, "s5_DARK_.csv", "1")?;
    Ok(vec![a, b])
}

#[test]
fn test_locate_groups_by_top_level_dir() -> Result<()> {
    let tmp = TempDir::new()?;
    let dirs = tree(tmp.path())?;
    let log = RunLog::capturing("t");

    let found = locate(&dirs, ".csv", stem, &log)?;
    assert_eq!(found.keys().collect::<Vec<_>>(), vec!["run_a", "run_b"]);

    let mut a: Vec<&str> = found["run_a"].iter().map(|c| c.key.as_str()).collect();
    a.sort_unstable();
    assert_eq!(a, vec!["S2", "s1", "s3"]);
    assert_eq!(found["run_b"].len(), 2);
    assert_eq!(candidate_count(&found), 5);

    // Null keys are silent.
    assert_eq!(log.warning_count(), 0);
    Ok(())
}

#[test]
fn test_flat_pool_and_exclude() -> Result<()> {
    let tmp = TempDir::new()?;
    let dirs = tree(tmp.path())?;
    let log = RunLog::capturing("t");

    let found = RecordLocator::new(".CSV")
        .with_flat_pool(true)
        .with_exclude(&["_DARK_", "_TI_"])?
        .locate(&dirs, stem, &log)?;
    assert_eq!(found.len(), 1);
    let all = &found[FLAT_GROUP];
    assert_eq!(all.len(), 4);
    assert!(all.iter().all(|c| c.key != "s5_DARK_"));
    Ok(())
}

#[test]
fn test_invalid_exclude_pattern() {
    assert!(RecordLocator::new(".csv").with_exclude(&["("]).is_err());
}

#[test]
fn test_missing_dir_is_a_warning() -> Result<()> {
    let tmp = TempDir::new()?;
    let log = RunLog::capturing("t");
    let found = locate(&[tmp.path().join("absent")], ".csv", stem, &log)?;
    assert!(found.is_empty());
    assert_eq!(log.warning_count(), 1);
    assert!(log.contains("does not exist"));
    Ok(())
}

#[test]
fn test_glob_data_dirs() -> Result<()> {
    let tmp = TempDir::new()?;
    tree(tmp.path())?;
    let log = RunLog::capturing("t");
    let pattern = tmp.path().join("run_*");
    let found = locate(&[pattern], ".csv", stem, &log)?;
    assert_eq!(found.len(), 2);
    assert_eq!(candidate_count(&found), 5);
    Ok(())
}

#[test]
fn test_candidate_paths_point_at_files() -> Result<()> {
    let tmp = TempDir::new()?;
    let dirs = tree(tmp.path())?;
    let log = RunLog::capturing("t");
    let found = locate(&dirs, ".csv", stem, &log)?;
    for c in found.values().flatten() {
        assert!(c.path.is_file());
        assert!(c.file_name().to_lowercase().ends_with(".csv"));
    }
    Ok(())
}
