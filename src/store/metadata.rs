//! The metadata side-store: one parquet file per output prefix holding the
//! full columnar table.
//!
//! Every commit reads the existing table, concatenates the batch after it
//! column by column (old rows first), and rewrites the whole file. The cost of
//! a commit therefore grows with the size of the store. The rewrite goes
//! through a temporary file in the same directory that is renamed over the
//! old one, so a crash leaves either the previous or the new table.
//!
//! Commits are split in two so the engine can validate the merge before it
//! touches the spectral archive:
//!
//! 1. [`MetadataStore::stage`] loads and merges, failing on schema conflicts.
//! 2. [`MetadataStore::persist`] writes the merged table.

use crate::error::IngestError;
use crate::record::{Column, ColumnKind, ColumnarTable};
use anyhow::{Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, Schema,
    UInt8Type, UInt16Type, UInt32Type,
};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Handle on `<output>/<prefix>_meta.parquet`.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn corrupt(&self, reason: impl ToString) -> IngestError {
        IngestError::CorruptSideStore {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Read the whole table. A missing file is an empty table.
    ///
    /// # Errors
    /// Undecodable content is [`IngestError::CorruptSideStore`].
    pub fn load(&self) -> Result<ColumnarTable> {
        if !self.exists() {
            return Ok(ColumnarTable::new());
        }
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| self.corrupt(e))?;

        let mut columns = BTreeMap::new();
        for field in builder.schema().fields() {
            let kind = column_kind(field.data_type())
                .ok_or_else(|| self.corrupt(format!("unsupported type for '{}'", field.name())))?;
            columns.insert(field.name().clone(), Column::empty(kind));
        }

        let reader = builder.build().map_err(|e| self.corrupt(e))?;
        for batch in reader {
            let batch = batch.map_err(|e| self.corrupt(e))?;
            let schema = batch.schema();
            for (field, array) in schema.fields().iter().zip(batch.columns()) {
                let chunk = to_column(array).map_err(|r| self.corrupt(format!("'{}': {r}", field.name())))?;
                if let Some(col) = columns.get_mut(field.name()) {
                    col.extend(&chunk).map_err(|r| self.corrupt(r))?;
                }
            }
        }
        Ok(ColumnarTable::from_columns(columns)?)
    }

    /// Row count from the parquet footer, without reading any data.
    ///
    /// # Errors
    /// Same as [`Self::load`].
    pub fn row_count(&self) -> Result<u64> {
        if !self.exists() {
            return Ok(0);
        }
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| self.corrupt(e))?;
        let rows = builder.metadata().file_metadata().num_rows();
        u64::try_from(rows).map_err(|_| self.corrupt(format!("negative row count {rows} in footer")).into())
    }

    /// Load the existing table and append `batch` after it.
    ///
    /// Nothing is written.
    ///
    /// # Errors
    /// Fails with [`IngestError::SchemaMismatch`] when the field sets differ or
    /// a column changes kind.
    pub fn stage(&self, batch: &ColumnarTable) -> Result<ColumnarTable> {
        let mut merged = self.load()?;
        merged.concat(batch)?;
        Ok(merged)
    }

    /// Replace the file with `table`.
    ///
    /// # Errors
    /// Returns an error if the table cannot be encoded or the file cannot be
    /// written and renamed into place.
    pub fn persist(&self, table: &ColumnarTable) -> Result<()> {
        if table.is_empty() {
            return Ok(());
        }
        let batch = to_record_batch(table)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;

        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), batch.schema(), Some(props))
            .context("create ArrowWriter")?;
        writer.write(&batch).context("write metadata batch")?;
        writer.close().context("close ArrowWriter")?;

        tmp.as_file()
            .sync_all()
            .with_context(|| format!("sync {}", tmp.path().display()))?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    /// Stage and persist in one step. Returns the new total row count.
    ///
    /// # Errors
    /// See [`Self::stage`] and [`Self::persist`].
    pub fn append(&self, batch: &ColumnarTable) -> Result<usize> {
        let merged = self.stage(batch)?;
        self.persist(&merged)?;
        Ok(merged.row_count())
    }
}

fn column_kind(dt: &DataType) -> Option<ColumnKind> {
    Some(match dt {
        DataType::Boolean => ColumnKind::Bool,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => ColumnKind::Int,
        DataType::Float32 | DataType::Float64 => ColumnKind::Float,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary => {
            ColumnKind::Text
        }
        _ => return None,
    })
}

fn to_record_batch(table: &ColumnarTable) -> Result<RecordBatch> {
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for (name, col) in table.columns() {
        let (dt, array): (DataType, ArrayRef) = match col {
            Column::Bool(v) => (DataType::Boolean, Arc::new(BooleanArray::from(v.clone()))),
            Column::Int(v) => (DataType::Int64, Arc::new(Int64Array::from(v.clone()))),
            Column::Float(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
            Column::Text(v) => (DataType::Utf8, Arc::new(StringArray::from(v.clone()))),
        };
        fields.push(Field::new(name.as_str(), dt, false));
        arrays.push(array);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("build metadata RecordBatch")
}

fn utf8(bytes: &[u8]) -> Result<String, String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| format!("invalid UTF-8: {e}"))
}

fn ints<T>(array: &ArrayRef) -> Vec<i64>
where
    T: arrow::datatypes::ArrowPrimitiveType,
    T::Native: Into<i64>,
{
    array.as_primitive::<T>().values().iter().map(|&v| v.into()).collect()
}

/// Decode one arrow array into a [`Column`]. Nulls are rejected.
fn to_column(array: &ArrayRef) -> Result<Column, String> {
    if array.null_count() > 0 {
        return Err("contains nulls".into());
    }
    Ok(match array.data_type() {
        DataType::Boolean => Column::Bool(array.as_boolean().values().iter().collect()),
        DataType::Int8 => Column::Int(ints::<Int8Type>(array)),
        DataType::Int16 => Column::Int(ints::<Int16Type>(array)),
        DataType::Int32 => Column::Int(ints::<Int32Type>(array)),
        DataType::Int64 => Column::Int(array.as_primitive::<Int64Type>().values().to_vec()),
        DataType::UInt8 => Column::Int(ints::<UInt8Type>(array)),
        DataType::UInt16 => Column::Int(ints::<UInt16Type>(array)),
        DataType::UInt32 => Column::Int(ints::<UInt32Type>(array)),
        DataType::Float32 => Column::Float(
            array
                .as_primitive::<Float32Type>()
                .values()
                .iter()
                .map(|&v| f64::from(v))
                .collect(),
        ),
        DataType::Float64 => Column::Float(array.as_primitive::<Float64Type>().values().to_vec()),
        DataType::Utf8 => Column::Text(
            array.as_string::<i32>().iter().map(|s| s.unwrap_or_default().to_owned()).collect(),
        ),
        DataType::LargeUtf8 => Column::Text(
            array.as_string::<i64>().iter().map(|s| s.unwrap_or_default().to_owned()).collect(),
        ),
        DataType::Binary => Column::Text(
            array
                .as_binary::<i32>()
                .iter()
                .map(|b| utf8(b.unwrap_or_default()))
                .collect::<Result<_, _>>()?,
        ),
        DataType::LargeBinary => Column::Text(
            array
                .as_binary::<i64>()
                .iter()
                .map(|b| utf8(b.unwrap_or_default()))
                .collect::<Result<_, _>>()?,
        ),
        other => return Err(format!("unsupported column type {other}")),
    })
}

/// Render a key column as strings: text as-is, binary decoded as UTF-8,
/// numbers in their decimal form.
///
/// # Errors
/// Fails on nulls, invalid UTF-8 or a non-key column type.
pub fn key_strings(array: &ArrayRef) -> Result<Vec<String>, String> {
    match to_column(array)? {
        Column::Bool(_) => Err("boolean columns cannot hold keys".into()),
        col => Ok(col.to_keys()),
    }
}
