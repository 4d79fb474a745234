//! Tests for processor settings and the registry.

use anyhow::Result;
use serde_json::json;
use spectral_ingest::config::{DatasetConfig, Driver};
use spectral_ingest::error::IngestError;
use spectral_ingest::processor::{Layout, ProcessorDefaults, ProcessorRegistry};
use spectral_ingest::testing::{ShotCsvProcessor, TrajectoryCsvProcessor, registry};

fn dataset(kind: &str) -> DatasetConfig {
    let mut config = DatasetConfig::new("ds", kind);
    config.metadata = vec!["master.csv".into()];
    config
}

fn invalid_config(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<IngestError>(), Some(IngestError::InvalidConfig(_)))
}

#[test]
fn test_resolve_applies_config_over_defaults() -> Result<()> {
    let defaults = ProcessorDefaults::vector(".spc", "sample_id")
        .with_channels(6144)
        .with_driver(Driver::family());

    let settings = defaults.resolve(&dataset("X"))?;
    assert_eq!(settings.file_ext, ".spc");
    assert_eq!(settings.pkey_field, "sample_id");
    assert_eq!(settings.layout, Layout::Vector { channels: 6144 });
    assert!(matches!(settings.driver, Driver::Family { .. }));

    let mut config = dataset("X");
    config.channels = Some(128);
    config.file_ext = Some(".txt".into());
    config.driver = Some(Driver::Single);
    let settings = defaults.resolve(&config)?;
    assert_eq!(settings.file_ext, ".txt");
    assert_eq!(settings.layout, Layout::Vector { channels: 128 });
    assert_eq!(settings.driver, Driver::Single);
    Ok(())
}

#[test]
fn test_vector_processors_require_channels() {
    let err = ProcessorDefaults::vector(".csv", "id")
        .resolve(&dataset("X"))
        .unwrap_err();
    assert!(err.to_string().contains("attribute \"channels\" is required"));

    let mut zero = dataset("X");
    zero.channels = Some(0);
    assert!(ProcessorDefaults::vector(".csv", "id").resolve(&zero).is_err());

    // Trajectory archives have no row width.
    let settings = ProcessorDefaults::trajectory(".txt", "id")
        .resolve(&dataset("X"))
        .unwrap();
    assert_eq!(settings.layout, Layout::Trajectory);
}

#[test]
fn test_registry_builds_known_types() -> Result<()> {
    let registry = registry();
    assert_eq!(
        registry.kinds().collect::<Vec<_>>(),
        vec![ShotCsvProcessor::KIND, TrajectoryCsvProcessor::KIND]
    );

    let mut config = dataset(ShotCsvProcessor::KIND);
    config.channels = Some(10);
    let processor = registry.build(&config)?;
    assert_eq!(processor.settings().layout, Layout::Vector { channels: 10 });
    assert_eq!(processor.identify("S1.CSV").as_deref(), Some("S1"));
    assert_eq!(processor.identify("_calibration.csv"), None);
    assert_eq!(processor.identify("notes.txt"), None);
    assert_eq!(processor.record_key_for_stored("S1").as_deref(), Some("S1"));
    Ok(())
}

#[test]
fn test_registry_rejects_bad_datasets() {
    let registry = registry();
    let err = registry.build(&dataset("Unknown")).err().expect("unknown type");
    assert!(invalid_config(&err));
    assert!(err.to_string().contains("unknown type Unknown"));

    let mut no_meta = dataset(TrajectoryCsvProcessor::KIND);
    no_meta.metadata.clear();
    assert!(invalid_config(&registry.build(&no_meta).err().expect("missing metadata")));

    let mut bad_options = dataset(ShotCsvProcessor::KIND);
    bad_options.channels = Some(4);
    bad_options.options = json!({ "no_such_option": true });
    assert!(invalid_config(&registry.build(&bad_options).err().expect("bad options")));
}

#[test]
fn test_register_replaces_entries() {
    let mut registry = ProcessorRegistry::new();
    registry
        .register("Shots", ShotCsvProcessor::boxed)
        .register("Shots", TrajectoryCsvProcessor::boxed);
    assert!(registry.contains("Shots"));
    assert_eq!(registry.kinds().count(), 1);
    let processor = registry
        .build(&dataset("Shots"))
        .ok()
        .expect("trajectory processor needs no channels");
    assert_eq!(processor.settings().layout, Layout::Trajectory);
}
