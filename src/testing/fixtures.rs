//! Synthetic instrument files for tests.

use std::fs::{File, create_dir_all};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Deterministic spectra: `shots` rows of `channels` values, distinct per
/// `seed`.
///
/// # Example
///
/// ```
/// use spectral_ingest::testing::synthetic_shots;
///
/// let shots = synthetic_shots(3, 20, 1.0);
/// assert_eq!(shots.len(), 3);
/// assert!(shots.iter().all(|s| s.len() == 20));
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_shots(shots: usize, channels: usize, seed: f64) -> Vec<Vec<f64>> {
    (0..shots)
        .map(|s| {
            (0..channels)
                .map(|c| seed * 1000.0 + s as f64 * 10.0 + c as f64 * 0.5)
                .collect()
        })
        .collect()
}

fn create(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent)?;
    }
    File::create(path)
}

/// Write one shot per line, values comma-separated.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_shot_file(dir: &Path, name: &str, shots: &[Vec<f64>]) -> io::Result<PathBuf> {
    let path = dir.join(name);
    let mut f = create(&path)?;
    for shot in shots {
        let line: Vec<String> = shot.iter().map(f64::to_string).collect();
        writeln!(f, "{}", line.join(","))?;
    }
    Ok(path)
}

/// Write one `x,y` point per line.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_trajectory_file(dir: &Path, name: &str, points: &[[f64; 2]]) -> io::Result<PathBuf> {
    let path = dir.join(name);
    let mut f = create(&path)?;
    for [x, y] in points {
        writeln!(f, "{x},{y}")?;
    }
    Ok(path)
}

/// Write arbitrary text, e.g. a deliberately malformed instrument file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_raw_file(dir: &Path, name: &str, contents: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    create(&path)?.write_all(contents.as_bytes())?;
    Ok(path)
}

/// Write a master metadata table with a `key,sample` header.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_master_table(path: &Path, rows: &[(&str, &str)]) -> io::Result<()> {
    let mut f = create(path)?;
    writeln!(f, "key,sample")?;
    for (key, sample) in rows {
        writeln!(f, "{key},{sample}")?;
    }
    Ok(())
}

/// A simple curve with `n` points, shifted by `offset`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_trajectory(n: usize, offset: f64) -> Vec<[f64; 2]> {
    (0..n).map(|i| [i as f64, offset + (i as f64).sqrt()]).collect()
}
