//! Logging for ingestion runs.
//!
//! Events go through `tracing`. [`init_tracing`] installs a formatted
//! subscriber once per process; every run then owns a [`RunLog`] handle that
//! is passed explicitly to the components it drives. The handle scopes events
//! to a span carrying the dataset name, counts warnings and errors, and can
//! keep an in-memory journal for summaries and tests.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Display;
use std::fs::{OpenOptions, create_dir_all};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. When `config.filename` is
/// set, output is appended to that file (relative names are placed under
/// `log_dir`), otherwise it goes to stdout. Calling this more than once is
/// harmless: later calls leave the first subscriber in place.
///
/// # Errors
/// Returns an error if the log file or its directory cannot be created.
pub fn init_tracing(config: &LoggingConfig, log_dir: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match &config.filename {
        Some(name) => {
            let path = match log_dir {
                Some(dir) if name.is_relative() => dir.join(name),
                _ => name.clone(),
            };
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stdout).try_init(),
    };
    // A subscriber is already installed; keep it.
    installed.ok();
    Ok(())
}

/// Severity of a journaled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One journaled message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Logger handle for one ingestion run.
pub struct RunLog {
    span: Span,
    journal: Option<Mutex<Vec<LogEntry>>>,
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

impl RunLog {
    /// A handle that only forwards to `tracing`.
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self {
            span: tracing::info_span!("ingest", dataset = %dataset),
            journal: None,
            warnings: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    /// A handle that also keeps every message in memory.
    #[must_use]
    pub fn capturing(dataset: &str) -> Self {
        Self {
            journal: Some(Mutex::new(Vec::new())),
            ..Self::new(dataset)
        }
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, message: impl Display) {
        tracing::debug!(parent: &self.span, "{message}");
        self.journal(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Display) {
        tracing::info!(parent: &self.span, "{message}");
        self.journal(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(parent: &self.span, "{message}");
        self.journal(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(parent: &self.span, "{message}");
        self.journal(LogLevel::Error, message);
    }

    /// Warn that a record was dropped, with structured key and path fields.
    pub fn record_skipped(&self, key: &str, path: &Path, reason: impl Display) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            parent: &self.span,
            key = %key,
            path = %path.display(),
            "skipping record: {reason}"
        );
        self.journal(
            LogLevel::Warn,
            format!("skipping record {key} ({}): {reason}", path.display()),
        );
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Journaled messages; empty unless built with [`RunLog::capturing`].
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.journal.as_ref().map_or_else(Vec::new, |j| {
            j.lock().unwrap_or_else(PoisonError::into_inner).clone()
        })
    }

    /// Whether any journaled message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries().iter().any(|e| e.message.contains(needle))
    }

    fn journal(&self, level: LogLevel, message: impl Display) {
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(LogEntry {
                    level,
                    message: message.to_string(),
                });
        }
    }
}
