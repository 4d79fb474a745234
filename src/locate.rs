//! Input discovery.
//!
//! [`RecordLocator`] walks the data directories, keeps files whose names end
//! with the configured extension (case-insensitively), drops excluded names,
//! and asks an identity function for each file's record key. Files without a
//! key are ignored without a warning; some instruments write structurally
//! invalid names that are expected to be skipped.
//!
//! Results are grouped by the basename of the top-level data directory they
//! came from, or under `"."` when the dataset is a flat pool. Groups only
//! affect batch labels.

use crate::logging::RunLog;
use anyhow::{Context, Result};
use glob::glob;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Group name used when all inputs form one pool.
pub const FLAT_GROUP: &str = ".";

/// One input file and its record key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub key: String,
    pub path: PathBuf,
}

impl Candidate {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
        }
    }

    /// The file name component, lossily decoded.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Group name to candidates, in discovery order within each group.
pub type Located = BTreeMap<String, Vec<Candidate>>;

/// Total number of candidates across groups.
#[must_use]
pub fn candidate_count(located: &Located) -> usize {
    located.values().map(Vec::len).sum()
}

/// Directory walker with an extension filter and exclusion patterns.
#[derive(Clone, Debug)]
pub struct RecordLocator {
    file_ext: String,
    flat_pool: bool,
    exclude: Vec<Regex>,
}

impl RecordLocator {
    #[must_use]
    pub fn new(file_ext: &str) -> Self {
        Self {
            file_ext: file_ext.to_lowercase(),
            flat_pool: false,
            exclude: Vec::new(),
        }
    }

    /// Put every file in the single [`FLAT_GROUP`].
    #[must_use]
    pub fn with_flat_pool(mut self, flat_pool: bool) -> Self {
        self.flat_pool = flat_pool;
        self
    }

    /// Skip file names matching any of these regexes.
    ///
    /// # Errors
    /// Returns an error if a pattern does not compile.
    pub fn with_exclude<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        for p in patterns {
            let p = p.as_ref();
            self.exclude
                .push(Regex::new(p).with_context(|| format!("invalid exclude pattern: {p}"))?);
        }
        Ok(self)
    }

    fn accepts(&self, file_name: &str) -> bool {
        file_name.to_lowercase().ends_with(&self.file_ext)
            && !self.exclude.iter().any(|re| re.is_match(file_name))
    }

    /// Walk `data_dirs` recursively and key every accepted file with `identify`.
    ///
    /// Missing directories and unreadable entries are logged and skipped.
    ///
    /// # Errors
    /// Returns an error only for an invalid glob pattern in `data_dirs`.
    pub fn locate<F>(&self, data_dirs: &[PathBuf], identify: F, log: &RunLog) -> Result<Located>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut located = Located::new();
        for top in expand_data_dirs(data_dirs)? {
            if !top.is_dir() {
                log.warn(format!("data directory {} does not exist", top.display()));
                continue;
            }
            let group = if self.flat_pool {
                FLAT_GROUP.to_string()
            } else {
                group_name(&top)
            };
            let found = located.entry(group).or_default();
            for entry in WalkDir::new(&top).sort_by_file_name() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        log.warn(format!("cannot read entry under {}: {e}", top.display()));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str() else {
                    log.debug(format!("ignoring non-UTF-8 file name {}", entry.path().display()));
                    continue;
                };
                if !self.accepts(name) {
                    continue;
                }
                if let Some(key) = identify(name) {
                    found.push(Candidate::new(key, entry.path()));
                }
            }
        }
        located.retain(|_, v| !v.is_empty());
        Ok(located)
    }
}

/// Convenience wrapper: locate with only an extension filter.
///
/// # Errors
/// See [`RecordLocator::locate`].
pub fn locate<F>(data_dirs: &[PathBuf], file_ext: &str, identify: F, log: &RunLog) -> Result<Located>
where
    F: Fn(&str) -> Option<String>,
{
    RecordLocator::new(file_ext).locate(data_dirs, identify, log)
}

fn group_name(dir: &Path) -> String {
    dir.file_name()
        .map_or_else(|| FLAT_GROUP.to_string(), |n| n.to_string_lossy().into_owned())
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Expand entries that contain glob metacharacters into the sorted list of
/// matching directories; other entries pass through unchanged.
fn expand_data_dirs(data_dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for dir in data_dirs {
        let pattern = dir.to_string_lossy();
        if !has_glob_meta(&pattern) {
            out.push(dir.clone());
            continue;
        }
        let mut matched = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
            let path =
                entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
            if path.is_dir() {
                matched.push(path);
            }
        }
        matched.sort();
        out.extend(matched);
    }
    Ok(out)
}
