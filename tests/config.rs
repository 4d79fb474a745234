//! Tests for configuration loading and validation.

use anyhow::Result;
use serde::Deserialize;
use spectral_ingest::config::{DEFAULT_BATCH_SIZE, DatasetConfig, Driver, IngestConfig, Parallelism};
use spectral_ingest::error::IngestError;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

const DOC: &str = r"
root_dir: /data
chunk_size: 50
logging:
  level: debug
datasets:
  - name: raman
    type: ShotCsv
    base_dir: raman
    metadata: master.csv
    data_dir: [spectra, 'runs/*']
    output_prefix: raman
    channels: 1024
    exclude: ['_DARK_', '_TI_']
  - name: moss
    type: TrajectoryCsv
    metadata: [a.csv, b.csv]
    data_dir: traj
    batch_size: 7
    driver: single
    options:
      require_master: true
  - type: ShotCsv
    metadata: x.csv
";

#[test]
fn test_parse_document() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str(DOC)?;
    assert_eq!(cfg.root_dir, PathBuf::from("/data"));
    assert_eq!(cfg.chunk_size, 50);
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.logging.filename.is_none());
    assert_eq!(cfg.parallelism, Parallelism::Sequential);
    assert_eq!(cfg.datasets.len(), 3);

    let raman = &cfg.datasets[0];
    assert_eq!(raman.kind.as_deref(), Some("ShotCsv"));
    assert_eq!(raman.metadata, vec!["master.csv"]);
    assert_eq!(raman.data_dir, vec!["spectra", "runs/*"]);
    assert_eq!(raman.channels, Some(1024));
    assert_eq!(raman.exclude.len(), 2);
    assert_eq!(raman.log_dir, "nightly-logs");
    assert_eq!(raman.output_dir, "to-DEVAS");

    let moss = &cfg.datasets[1];
    assert_eq!(moss.metadata, vec!["a.csv", "b.csv"]);
    assert_eq!(moss.data_dir, vec!["traj"]);
    assert_eq!(moss.output_prefix, "prepro_no_blr");
    assert_eq!(moss.driver, Some(Driver::Single));
    assert_eq!(moss.batch_size, Some(7));
    Ok(())
}

#[test]
fn test_resolved_datasets_inherit_globals() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str(DOC)?;
    let resolved = cfg.resolved_datasets();
    assert!(resolved.iter().all(|d| d.root_dir == PathBuf::from("/data")));
    assert_eq!(resolved[0].batch_size(), 50);
    assert_eq!(resolved[1].batch_size(), 7);
    assert!(resolved.iter().all(|d| d.parallelism == Some(Parallelism::Sequential)));
    Ok(())
}

#[test]
fn test_defaults_without_globals() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str("datasets: []")?;
    assert_eq!(cfg.chunk_size, DEFAULT_BATCH_SIZE);
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(DatasetConfig::default().batch_size(), 500);
    Ok(())
}

#[test]
fn test_batch_size_alias() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str("batch_size: 12\ndatasets: []")?;
    assert_eq!(cfg.chunk_size, 12);
    Ok(())
}

#[test]
fn test_load_from_file() -> Result<()> {
    let mut f = NamedTempFile::new()?;
    f.write_all(DOC.as_bytes())?;
    let cfg = IngestConfig::load(f.path())?;
    assert_eq!(cfg.datasets.len(), 3);
    assert!(IngestConfig::load("/definitely/not/here.yaml").is_err());
    Ok(())
}

#[test]
fn test_validate_reports_missing_fields() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str(DOC)?;
    assert!(cfg.datasets[0].validate().is_ok());

    let err = cfg.datasets[2].validate().unwrap_err();
    assert!(matches!(err, IngestError::InvalidConfig(ref m) if m.contains("name")));

    let mut no_meta = DatasetConfig::new("x", "ShotCsv");
    let err = no_meta.validate().unwrap_err();
    assert!(err.to_string().contains("metadata"));

    no_meta.metadata = vec!["m.csv".into()];
    no_meta.batch_size = Some(0);
    assert!(no_meta.validate().is_err());

    no_meta.batch_size = None;
    no_meta.driver = Some(Driver::Family { segment_rows: 0 });
    assert!(no_meta.validate().is_err());
    Ok(())
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct Opts {
    require_master: bool,
    threshold: Option<f64>,
}

#[test]
fn test_typed_options() -> Result<()> {
    let cfg = IngestConfig::from_yaml_str(DOC)?;
    let opts: Opts = cfg.datasets[1].options()?;
    assert_eq!(
        opts,
        Opts {
            require_master: true,
            threshold: None
        }
    );

    // A missing block deserializes as all defaults.
    let opts: Opts = cfg.datasets[0].options()?;
    assert_eq!(opts, Opts::default());

    let mut bad = cfg.datasets[1].clone();
    bad.options = serde_json::json!({ "unknown": 1 });
    assert!(matches!(bad.options::<Opts>(), Err(IngestError::InvalidConfig(_))));
    Ok(())
}

#[test]
fn test_driver_and_parallelism_json() -> Result<()> {
    let ds: DatasetConfig = serde_json::from_str(
        r#"{"name":"v","type":"ShotCsv","metadata":"m.csv","driver":{"family":{"segment_rows":10}},"parallelism":{"parallel":{"threads":2}}}"#,
    )?;
    assert_eq!(ds.driver, Some(Driver::Family { segment_rows: 10 }));
    assert_eq!(ds.parallelism, Some(Parallelism::Parallel { threads: Some(2) }));
    assert!(matches!(Driver::family(), Driver::Family { segment_rows } if segment_rows > 0));
    Ok(())
}
