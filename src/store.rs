//! Persistent stores.
//!
//! - [`vector::VectorStore`]: append-only fixed-width rows.
//! - [`trajectory::TrajectoryStore`]: keyed trajectories, overwrite on
//!   duplicate key.
//! - [`metadata::MetadataStore`]: the columnar side-store.
//!
//! The two spectral archives sit behind [`SpectralWriter`], chosen once per
//! run from the processor's [`Layout`] by [`open_writer`].

pub mod metadata;
pub mod trajectory;
pub mod vector;

use crate::config::Driver;
use crate::logging::RunLog;
use crate::paths::{ResolvedPaths, TRAJECTORY_EXT};
use crate::processor::Layout;
use crate::record::{Matrix, Trajectory};
use anyhow::{Result, bail};
use std::path::PathBuf;

pub use metadata::MetadataStore;
pub use trajectory::TrajectoryStore;
pub use vector::VectorStore;

/// Spectral data gathered for one batch, ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchPayload {
    /// Rows of every record, stacked in record order.
    Rows(Matrix),
    /// One trajectory per shot, in record order.
    Trajectories(Vec<Trajectory>),
}

impl BatchPayload {
    /// Number of shots (rows or trajectories).
    #[must_use]
    pub fn shot_count(&self) -> usize {
        match self {
            Self::Rows(m) => m.rows(),
            Self::Trajectories(t) => t.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shot_count() == 0
    }
}

/// Write strategy for a spectral archive.
pub trait SpectralWriter {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Repair the archive against the number of rows committed to the
    /// side-store by earlier runs.
    ///
    /// # Errors
    /// Fails when the archive cannot be brought in line.
    fn reconcile(&mut self, committed_rows: u64, log: &RunLog) -> Result<()>;

    /// Append one batch. `keys` holds the primary key of every shot.
    /// Returns the number of shots written.
    ///
    /// # Errors
    /// Any failure is fatal for the run.
    fn append(&mut self, payload: &BatchPayload, keys: &[String], log: &RunLog) -> Result<usize>;
}

impl SpectralWriter for VectorStore {
    fn describe(&self) -> String {
        self.segment_path(0).display().to_string()
    }

    fn reconcile(&mut self, committed_rows: u64, log: &RunLog) -> Result<()> {
        VectorStore::reconcile(self, committed_rows, log)
    }

    fn append(&mut self, payload: &BatchPayload, _keys: &[String], _log: &RunLog) -> Result<usize> {
        match payload {
            BatchPayload::Rows(rows) => {
                VectorStore::append(self, rows)?;
                Ok(rows.rows())
            }
            BatchPayload::Trajectories(_) => bail!("trajectory batch sent to a vector archive"),
        }
    }
}

impl SpectralWriter for TrajectoryStore {
    fn describe(&self) -> String {
        self.path().display().to_string()
    }

    // Entries are keyed, so there is no row count to line up.
    fn reconcile(&mut self, _committed_rows: u64, _log: &RunLog) -> Result<()> {
        Ok(())
    }

    fn append(&mut self, payload: &BatchPayload, keys: &[String], log: &RunLog) -> Result<usize> {
        match payload {
            BatchPayload::Trajectories(t) => TrajectoryStore::append(self, keys, t, log),
            BatchPayload::Rows(_) => bail!("row batch sent to a trajectory archive"),
        }
    }
}

/// Path of the trajectory log for an output stem.
#[must_use]
pub fn trajectory_path(paths: &ResolvedPaths) -> PathBuf {
    paths
        .output
        .join(format!("{}.{TRAJECTORY_EXT}", paths.output_prefix))
}

/// Open the archive that matches `layout`.
///
/// # Errors
/// Fails when an existing trajectory log cannot be scanned.
pub fn open_writer(layout: Layout, driver: Driver, paths: &ResolvedPaths) -> Result<Box<dyn SpectralWriter>> {
    Ok(match layout {
        Layout::Vector { channels } => Box::new(VectorStore::new(paths.output_stem(), channels, driver)),
        Layout::Trajectory => Box::new(TrajectoryStore::open(trajectory_path(paths))?),
    })
}
