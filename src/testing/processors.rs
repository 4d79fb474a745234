//! Reference processors.
//!
//! [`ShotCsvProcessor`] and [`TrajectoryCsvProcessor`] read the plain-text
//! formats written by [`super::fixtures`] and show how a real instrument
//! plugs into the engine. [`ScriptedProcessor`] reads nothing at all: every
//! outcome is scripted per key, which makes partial failures easy to stage.

use crate::config::{DatasetConfig, Driver};
use crate::error::{IngestError, RecordError};
use crate::locate::Candidate;
use crate::logging::RunLog;
use crate::processor::{Layout, ProcessorDefaults, ProcessorRegistry, ProcessorSettings, RecordProcessor};
use crate::record::{Column, ColumnarTable, Matrix, MetaValue, MetadataRecord, Payload, ProcessedRecord, Trajectory};
use crate::store::BatchPayload;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A registry with the reference processors under their type names.
#[must_use]
pub fn registry() -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with(ShotCsvProcessor::KIND, ShotCsvProcessor::boxed)
        .with(TrajectoryCsvProcessor::KIND, TrajectoryCsvProcessor::boxed)
}

/// Strip `ext` (case-insensitively) from `name`. Names starting with `_` are
/// treated as structurally invalid.
fn stem_of(name: &str, ext: &str) -> Option<String> {
    let cut = name.len().checked_sub(ext.len())?;
    let (stem, tail) = (name.get(..cut)?, name.get(cut..)?);
    if !tail.eq_ignore_ascii_case(ext) || stem.is_empty() || stem.starts_with('_') {
        return None;
    }
    Some(stem.to_owned())
}

fn csv_error(e: csv::Error) -> RecordError {
    let message = e.to_string();
    match e.into_kind() {
        csv::ErrorKind::Io(io) => RecordError::Io(io),
        _ => RecordError::Parse(message),
    }
}

fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>, RecordError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_error)?;
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let row = record
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|e| RecordError::Parse(format!("line {}: {v:?}: {e}", i + 1)))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Options for [`ShotCsvProcessor`], read from the dataset's `options` block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShotCsvOptions {
    /// Drop records missing from the master table instead of labelling them
    /// `unknown`.
    pub require_master: bool,
    /// Prepend the mean of all shots as shot 0.
    pub mean_row: bool,
    /// Store per-shot ids `<key>_<shot>` instead of repeating the key.
    pub shot_ids: bool,
    /// Add a `peak_fraction` column: each shot's maximum over the batch maximum.
    pub peak_fraction: bool,
}

/// Multi-shot spectra, one shot per line of comma-separated values.
#[derive(Debug)]
pub struct ShotCsvProcessor {
    settings: ProcessorSettings,
    options: ShotCsvOptions,
    master: HashMap<String, String>,
}

impl ShotCsvProcessor {
    pub const KIND: &'static str = "ShotCsv";

    #[must_use]
    pub fn defaults() -> ProcessorDefaults {
        ProcessorDefaults::vector(".csv", "id")
    }

    /// # Errors
    /// Invalid configuration or options.
    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        Ok(Self {
            settings: Self::defaults().resolve(config)?,
            options: config.options()?,
            master: HashMap::new(),
        })
    }

    /// Factory for [`ProcessorRegistry`].
    ///
    /// # Errors
    /// See [`Self::from_config`].
    pub fn boxed(config: &DatasetConfig) -> Result<Box<dyn RecordProcessor>> {
        Ok(Box::new(Self::from_config(config)?))
    }
}

impl RecordProcessor for ShotCsvProcessor {
    fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn identify(&self, file_name: &str) -> Option<String> {
        stem_of(file_name, &self.settings.file_ext)
    }

    fn record_key_for_stored(&self, stored: &str) -> Option<String> {
        if self.options.shot_ids {
            stored.rsplit_once('_').map(|(key, _)| key.to_owned())
        } else {
            Some(stored.to_owned())
        }
    }

    fn parse_metadata(&mut self, metadata_paths: &[PathBuf], log: &RunLog) -> Result<()> {
        for path in metadata_paths {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("open master table {}", path.display()))?;
            for record in reader.records() {
                let record = record.with_context(|| format!("read {}", path.display()))?;
                let (Some(key), Some(sample)) = (record.get(0), record.get(1)) else {
                    bail!("{}: expected key,sample columns", path.display());
                };
                self.master.insert(key.to_owned(), sample.to_owned());
            }
        }
        log.info(format!("Loaded {} master metadata rows", self.master.len()));
        Ok(())
    }

    fn process(&self, candidate: &Candidate, _log: &RunLog) -> Result<Option<ProcessedRecord>, RecordError> {
        let rows = read_rows(&candidate.path)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let sample = match self.master.get(&candidate.key) {
            Some(s) => s.clone(),
            None if self.options.require_master => {
                return Err(RecordError::Metadata(format!(
                    "no master metadata for {}",
                    candidate.key
                )));
            }
            None => "unknown".to_owned(),
        };

        let mut matrix = Matrix::from_rows(&rows)?;
        if self.options.mean_row {
            matrix = matrix.with_mean_row();
        }
        let n = matrix.rows();
        let key = &candidate.key;
        let ids: MetaValue = if self.options.shot_ids {
            (0..n).map(|i| format!("{key}_{i:03}")).collect()
        } else {
            (0..n).map(|_| key.clone()).collect()
        };
        let metadata = MetadataRecord::new()
            .with(self.settings.pkey_field.clone(), ids)
            .with("shot", (0_i64..).take(n).collect::<MetaValue>())
            .with("sample", sample)
            .with("file", candidate.file_name());
        Ok(Some(ProcessedRecord::new(Payload::Vector(matrix), metadata)))
    }

    fn derive_batch_columns(&self, metadata: &mut ColumnarTable, payload: &BatchPayload) -> Result<(), IngestError> {
        if !self.options.peak_fraction {
            return Ok(());
        }
        let BatchPayload::Rows(m) = payload else {
            return Ok(());
        };
        let peaks: Vec<f64> = (0..m.rows())
            .map(|r| m.row(r).iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .collect();
        let top = peaks.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let fractions = peaks
            .iter()
            .map(|p| if top > 0.0 { p / top } else { 0.0 })
            .collect();
        metadata.add_column("peak_fraction", Column::Float(fractions))
    }
}

/// Single trajectories, one `x,y` point per line.
#[derive(Debug)]
pub struct TrajectoryCsvProcessor {
    settings: ProcessorSettings,
}

impl TrajectoryCsvProcessor {
    pub const KIND: &'static str = "TrajectoryCsv";

    #[must_use]
    pub fn defaults() -> ProcessorDefaults {
        ProcessorDefaults::trajectory(".txt", "id")
    }

    /// # Errors
    /// Invalid configuration.
    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        Ok(Self {
            settings: Self::defaults().resolve(config)?,
        })
    }

    /// Factory for [`ProcessorRegistry`].
    ///
    /// # Errors
    /// See [`Self::from_config`].
    pub fn boxed(config: &DatasetConfig) -> Result<Box<dyn RecordProcessor>> {
        Ok(Box::new(Self::from_config(config)?))
    }
}

impl RecordProcessor for TrajectoryCsvProcessor {
    fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn identify(&self, file_name: &str) -> Option<String> {
        stem_of(file_name, &self.settings.file_ext)
    }

    fn process(&self, candidate: &Candidate, _log: &RunLog) -> Result<Option<ProcessedRecord>, RecordError> {
        let rows = read_rows(&candidate.path)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut points = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let &[x, y] = row.as_slice() else {
                return Err(RecordError::shape("2 columns", format!("{} on line {}", row.len(), i + 1)));
            };
            points.push([x, y]);
        }
        let metadata = MetadataRecord::new()
            .with(self.settings.pkey_field.clone(), candidate.key.clone())
            .with("points", i64::try_from(points.len()).unwrap_or(i64::MAX))
            .with("file", candidate.file_name());
        Ok(Some(ProcessedRecord::new(
            Payload::Trajectories(vec![Trajectory::new(points)]),
            metadata,
        )))
    }
}

/// Scripted outcome for one record key.
#[derive(Clone, Debug, PartialEq)]
pub enum Script {
    /// Succeed with this many synthetic shots.
    Shots(usize),
    /// Return no record.
    Skip,
    /// Fail with a parse error.
    Fail(String),
    /// Return exactly this record.
    Record(ProcessedRecord),
}

/// Call counters shared with the test that built the processor.
#[derive(Debug, Default)]
pub struct Counters {
    pub processed: AtomicUsize,
    pub metadata_loads: AtomicUsize,
}

impl Counters {
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn metadata_loads(&self) -> usize {
        self.metadata_loads.load(Ordering::SeqCst)
    }
}

/// In-memory processor: keys are file stems, outcomes come from a script.
/// Keys without a script succeed with one shot.
#[derive(Debug)]
pub struct ScriptedProcessor {
    settings: ProcessorSettings,
    scripts: HashMap<String, Script>,
    counters: Arc<Counters>,
}

impl ScriptedProcessor {
    /// Vector layout, `.dat` files, primary key `id`.
    #[must_use]
    pub fn vector(channels: usize) -> Self {
        Self::with_layout(Layout::Vector { channels })
    }

    /// Trajectory layout, `.dat` files, primary key `id`.
    #[must_use]
    pub fn trajectory() -> Self {
        Self::with_layout(Layout::Trajectory)
    }

    fn with_layout(layout: Layout) -> Self {
        Self {
            settings: ProcessorSettings {
                file_ext: ".dat".into(),
                pkey_field: "id".into(),
                layout,
                driver: Driver::Single,
            },
            scripts: HashMap::new(),
            counters: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.settings.driver = driver;
        self
    }

    #[must_use]
    pub fn with_script(mut self, key: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(key.into(), script);
        self
    }

    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    #[allow(clippy::cast_precision_loss)]
    fn synthesize(&self, key: &str, shots: usize) -> Result<ProcessedRecord, RecordError> {
        let channels = match self.settings.layout {
            Layout::Vector { channels } => channels,
            Layout::Trajectory => 0,
        };
        let seed = key.bytes().map(f64::from).sum::<f64>();
        let payload = if channels == 0 {
            Payload::Trajectories(
                (0..shots)
                    .map(|s| Trajectory::new(vec![[0.0, seed], [1.0, seed + s as f64]]))
                    .collect(),
            )
        } else {
            let data = (0..shots * channels).map(|i| seed + i as f64).collect();
            Payload::Vector(Matrix::from_flat(channels, data)?)
        };
        let metadata = MetadataRecord::new()
            .with(self.settings.pkey_field.clone(), (0..shots).map(|_| key.to_owned()).collect::<MetaValue>())
            .with("value", (0..shots).map(|s| seed + s as f64).collect::<MetaValue>());
        Ok(ProcessedRecord::new(payload, metadata))
    }
}

impl RecordProcessor for ScriptedProcessor {
    fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn identify(&self, file_name: &str) -> Option<String> {
        stem_of(file_name, &self.settings.file_ext)
    }

    fn parse_metadata(&mut self, _metadata_paths: &[PathBuf], _log: &RunLog) -> Result<()> {
        self.counters.metadata_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn process(&self, candidate: &Candidate, _log: &RunLog) -> Result<Option<ProcessedRecord>, RecordError> {
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        match self.scripts.get(&candidate.key) {
            None => self.synthesize(&candidate.key, 1).map(Some),
            Some(Script::Shots(n)) => self.synthesize(&candidate.key, *n).map(Some),
            Some(Script::Skip) => Ok(None),
            Some(Script::Fail(reason)) => Err(RecordError::Parse(reason.clone())),
            Some(Script::Record(r)) => Ok(Some(r.clone())),
        }
    }
}
