//! Value types that flow from record processors through the batch
//! accumulator into the stores.
//!
//! - [`Scalar`], [`MetaValue`] and [`MetadataRecord`] describe the per-record
//!   metadata a processor returns.
//! - [`Matrix`], [`Trajectory`] and [`Payload`] describe the spectral payload.
//! - [`Column`] and [`ColumnarTable`] are the columnar form used by the
//!   metadata side-store.

use crate::error::{IngestError, RecordError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn kind(&self) -> ColumnKind {
        match self {
            Self::Bool(_) => ColumnKind::Bool,
            Self::Int(_) => ColumnKind::Int,
            Self::Float(_) => ColumnKind::Float,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    /// Render the value as a record key.
    #[must_use]
    pub fn to_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! scalar_from {
    ($variant:ident, $conv:expr; $($t:ty),*) => {
        $(
            impl From<$t> for Scalar {
                fn from(v: $t) -> Self {
                    Self::$variant($conv(v))
                }
            }

            impl From<$t> for MetaValue {
                fn from(v: $t) -> Self {
                    Self::One(Scalar::from(v))
                }
            }
        )*
    };
}

scalar_from!(Int, i64::from; i64, i32, u32, i16, u16, u8);
scalar_from!(Float, f64::from; f64, f32);
scalar_from!(Bool, bool::from; bool);
scalar_from!(Text, String::from; String, &str);

/// A metadata field value: either one value for the whole record, or one
/// value per shot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    One(Scalar),
    PerShot(Vec<Scalar>),
}

impl MetaValue {
    /// Number of elements, counting a single value as 1.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::PerShot(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_per_shot(&self) -> bool {
        matches!(self, Self::PerShot(_))
    }

    fn kind(&self) -> Option<ColumnKind> {
        match self {
            Self::One(s) => Some(s.kind()),
            Self::PerShot(v) => v.first().map(Scalar::kind),
        }
    }

    fn get(&self, i: usize) -> Option<&Scalar> {
        match self {
            Self::One(s) => Some(s),
            Self::PerShot(v) => v.get(i),
        }
    }
}

impl From<Scalar> for MetaValue {
    fn from(v: Scalar) -> Self {
        Self::One(v)
    }
}

impl<T: Into<Scalar>> FromIterator<T> for MetaValue {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::PerShot(iter.into_iter().map(Into::into).collect())
    }
}

/// Field name to value mapping for one record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    fields: BTreeMap<String, MetaValue>,
}

impl MetadataRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<MetaValue>) {
        self.fields.insert(field.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&MetaValue> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.fields.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of shots this record describes, as given by its key field.
    #[must_use]
    pub fn shot_count(&self, pkey_field: &str) -> Option<usize> {
        self.get(pkey_field).map(MetaValue::count)
    }
}

/// Fixed-width numeric matrix, one row per shot.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    channels: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// An empty matrix with the given row width.
    #[must_use]
    pub fn empty(channels: usize) -> Self {
        Self {
            channels,
            data: Vec::new(),
        }
    }

    /// Build from row-major data.
    ///
    /// # Errors
    /// Fails when `data.len()` is not a multiple of `channels`.
    pub fn from_flat(channels: usize, data: Vec<f64>) -> Result<Self, RecordError> {
        if channels == 0 || data.len() % channels != 0 {
            return Err(RecordError::shape(
                format!("a multiple of {channels} values"),
                data.len(),
            ));
        }
        Ok(Self { channels, data })
    }

    /// Build from individual rows, which must all have the same width.
    ///
    /// # Errors
    /// Fails on ragged or empty input.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, RecordError> {
        let Some(first) = rows.first() else {
            return Err(RecordError::shape("at least one row", 0));
        };
        let channels = first.as_ref().len();
        let mut data = Vec::with_capacity(channels * rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != channels {
                return Err(RecordError::shape(
                    format!("{channels} channels"),
                    format!("{} channels in row {i}", row.len()),
                ));
            }
            data.extend_from_slice(row);
        }
        Self::from_flat(channels, data)
    }

    /// Insert the mean of the existing rows as row 0 (the averaged-shot
    /// convention used by multi-shot instruments).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn with_mean_row(self) -> Self {
        let rows = self.rows();
        if rows == 0 {
            return self;
        }
        let mut mean = vec![0.0; self.channels];
        for r in 0..rows {
            for (m, v) in mean.iter_mut().zip(self.row(r)) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= rows as f64);
        mean.extend(self.data);
        Self {
            channels: self.channels,
            data: mean,
        }
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.channels).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.channels..(i + 1) * self.channels]
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Vertically stack `other` below `self`.
    ///
    /// # Errors
    /// Fails when the row widths differ.
    pub fn append(&mut self, other: &Self) -> Result<(), RecordError> {
        if other.channels != self.channels {
            return Err(RecordError::shape(
                format!("{} channels", self.channels),
                format!("{} channels", other.channels),
            ));
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }
}

/// Variable-length sequence of `[x, y]` points.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<[f64; 2]>,
}

impl Trajectory {
    #[must_use]
    pub fn new(points: Vec<[f64; 2]>) -> Self {
        Self { points }
    }

    /// Zip separate x and y axes.
    ///
    /// # Errors
    /// Fails when the axes have different lengths.
    pub fn from_axes(x: &[f64], y: &[f64]) -> Result<Self, RecordError> {
        if x.len() != y.len() {
            return Err(RecordError::shape(
                format!("{} y values", x.len()),
                y.len(),
            ));
        }
        Ok(Self::new(x.iter().zip(y).map(|(&a, &b)| [a, b]).collect()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Spectral payload produced for one record.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Fixed-width rows, one per shot.
    Vector(Matrix),
    /// One trajectory per shot.
    Trajectories(Vec<Trajectory>),
}

impl Payload {
    #[must_use]
    pub fn shot_count(&self) -> usize {
        match self {
            Self::Vector(m) => m.rows(),
            Self::Trajectories(t) => t.len(),
        }
    }
}

/// What a processor returns for one successfully parsed record.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedRecord {
    pub payload: Payload,
    pub metadata: MetadataRecord,
}

impl ProcessedRecord {
    #[must_use]
    pub fn new(payload: Payload, metadata: MetadataRecord) -> Self {
        Self { payload, metadata }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

impl ColumnKind {
    /// Int and Float merge (as Float); everything else must match exactly.
    fn compatible(self, other: Self) -> bool {
        self == other || matches!((self, other), (Self::Int, Self::Float) | (Self::Float, Self::Int))
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
        })
    }
}

/// A typed metadata column.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl Column {
    /// An empty column of the given kind.
    #[must_use]
    pub fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Bool => Self::Bool(Vec::new()),
            ColumnKind::Int => Self::Int(Vec::new()),
            ColumnKind::Float => Self::Float(Vec::new()),
            ColumnKind::Text => Self::Text(Vec::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Bool(_) => ColumnKind::Bool,
            Self::Int(_) => ColumnKind::Int,
            Self::Float(_) => ColumnKind::Float,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `i` as a [`Scalar`].
    #[must_use]
    pub fn get(&self, i: usize) -> Option<Scalar> {
        match self {
            Self::Bool(v) => v.get(i).copied().map(Scalar::Bool),
            Self::Int(v) => v.get(i).copied().map(Scalar::Int),
            Self::Float(v) => v.get(i).copied().map(Scalar::Float),
            Self::Text(v) => v.get(i).cloned().map(Scalar::Text),
        }
    }

    /// Every value rendered as a key string.
    #[must_use]
    pub fn to_keys(&self) -> Vec<String> {
        (0..self.len())
            .filter_map(|i| self.get(i).map(|s| s.to_key()))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn promote_to_float(&mut self) {
        if let Self::Int(v) = self {
            *self = Self::Float(v.iter().map(|&i| i as f64).collect());
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, value: &Scalar) {
        if matches!((&*self, value), (Self::Int(_), Scalar::Float(_))) {
            self.promote_to_float();
        }
        match (self, value) {
            (Self::Bool(v), Scalar::Bool(b)) => v.push(*b),
            (Self::Int(v), Scalar::Int(i)) => v.push(*i),
            (Self::Float(v), Scalar::Float(x)) => v.push(*x),
            (Self::Float(v), Scalar::Int(i)) => v.push(*i as f64),
            (Self::Text(v), Scalar::Text(s)) => v.push(s.clone()),
            // Kinds are checked by the caller before any push.
            _ => {}
        }
    }

    /// Concatenate `other` after `self`, promoting ints to floats when the two
    /// disagree.
    ///
    /// # Errors
    /// Fails when the column kinds cannot be merged.
    pub fn extend(&mut self, other: &Self) -> Result<(), String> {
        if !self.kind().compatible(other.kind()) {
            return Err(format!("cannot append {} values to a {} column", other.kind(), self.kind()));
        }
        if matches!((&*self, other), (Self::Int(_), Self::Float(_))) {
            self.promote_to_float();
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float(a), Self::Int(b)) => a.extend(b.iter().map(|&i| i as f64)),
            (Self::Text(a), Self::Text(b)) => a.extend_from_slice(b),
            _ => {}
        }
        Ok(())
    }
}

/// Columnar metadata: field name to equal-length column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnarTable {
    columns: BTreeMap<String, Column>,
    rows: usize,
}

impl ColumnarTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pre-made columns.
    ///
    /// # Errors
    /// Fails when the columns have different lengths.
    pub fn from_columns(columns: BTreeMap<String, Column>) -> Result<Self, IngestError> {
        let rows = columns.values().next().map_or(0, Column::len);
        if let Some((name, col)) = columns.iter().find(|(_, c)| c.len() != rows) {
            return Err(IngestError::SchemaMismatch {
                field: name.clone(),
                reason: format!("has {} rows, expected {rows}", col.len()),
            });
        }
        Ok(Self { columns, rows })
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Column)> {
        self.columns.iter()
    }

    #[must_use]
    pub fn into_columns(self) -> BTreeMap<String, Column> {
        self.columns
    }

    /// The key column rendered as strings.
    #[must_use]
    pub fn keys(&self, pkey_field: &str) -> Option<Vec<String>> {
        self.column(pkey_field).map(Column::to_keys)
    }

    /// Add a column covering every existing row.
    ///
    /// # Errors
    /// Fails when the column length does not match the row count, or the
    /// name is already taken.
    pub fn add_column(&mut self, name: impl Into<String>, column: Column) -> Result<(), IngestError> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(IngestError::SchemaMismatch {
                field: name,
                reason: "column already exists".into(),
            });
        }
        if !self.columns.is_empty() && column.len() != self.rows {
            return Err(IngestError::SchemaMismatch {
                field: name,
                reason: format!("has {} rows, expected {}", column.len(), self.rows),
            });
        }
        self.rows = column.len();
        self.columns.insert(name, column);
        Ok(())
    }

    /// Check that `record`, expanded to `rows` rows, fits this table.
    ///
    /// An empty table accepts any record and adopts its schema on push.
    ///
    /// # Errors
    /// Returns a record-level error describing the first incompatibility.
    pub fn check_record(&self, record: &MetadataRecord, rows: usize) -> Result<(), RecordError> {
        if rows == 0 {
            return Err(RecordError::shape("at least one shot", 0));
        }
        for (name, value) in record.iter() {
            if let MetaValue::PerShot(v) = value {
                if v.len() != rows {
                    return Err(RecordError::shape(
                        format!("{rows} values for '{name}'"),
                        v.len(),
                    ));
                }
                if let Some(first) = v.first()
                    && v.iter().any(|s| !s.kind().compatible(first.kind()))
                {
                    return Err(RecordError::Metadata(format!("mixed value kinds in '{name}'")));
                }
            }
        }
        if self.columns.is_empty() {
            return Ok(());
        }
        if record.len() != self.columns.len() {
            return Err(RecordError::Metadata(format!(
                "has {} fields, batch schema has {}",
                record.len(),
                self.columns.len()
            )));
        }
        for (name, value) in record.iter() {
            let Some(col) = self.columns.get(name) else {
                return Err(RecordError::Metadata(format!("unexpected field '{name}'")));
            };
            if let Some(kind) = value.kind()
                && !col.kind().compatible(kind)
            {
                return Err(RecordError::Metadata(format!(
                    "field '{name}' is {kind}, batch column is {}",
                    col.kind()
                )));
            }
        }
        Ok(())
    }

    /// Append `record` broadcast to `rows` rows. Call [`Self::check_record`]
    /// first; an unchecked record may leave columns uneven.
    pub fn push_record(&mut self, record: &MetadataRecord, rows: usize) {
        for (name, value) in record.iter() {
            let Some(kind) = value.kind() else { continue };
            let col = self
                .columns
                .entry(name.clone())
                .or_insert_with(|| Column::empty(kind));
            for i in 0..rows {
                if let Some(v) = value.get(i) {
                    col.push(v);
                }
            }
        }
        self.rows += rows;
    }

    /// Concatenate `newer` after `self`, column by column.
    ///
    /// # Errors
    /// Both tables must have the same field set and compatible column kinds.
    pub fn concat(&mut self, newer: &Self) -> Result<(), IngestError> {
        if self.columns.is_empty() {
            *self = newer.clone();
            return Ok(());
        }
        if let Some(name) = newer.columns.keys().find(|k| !self.columns.contains_key(*k)) {
            return Err(IngestError::SchemaMismatch {
                field: name.clone(),
                reason: "not present in the existing side-store".into(),
            });
        }
        if let Some(name) = self.columns.keys().find(|k| !newer.columns.contains_key(*k)) {
            return Err(IngestError::SchemaMismatch {
                field: name.clone(),
                reason: "missing from the new batch".into(),
            });
        }
        for (name, col) in &newer.columns {
            if let Some(existing) = self.columns.get(name)
                && !existing.kind().compatible(col.kind())
            {
                return Err(IngestError::SchemaMismatch {
                    field: name.clone(),
                    reason: format!("cannot append {} values to a {} column", col.kind(), existing.kind()),
                });
            }
        }
        for (name, col) in &newer.columns {
            if let Some(existing) = self.columns.get_mut(name) {
                existing
                    .extend(col)
                    .map_err(|reason| IngestError::SchemaMismatch {
                        field: name.clone(),
                        reason,
                    })?;
            }
        }
        self.rows += newer.rows;
        Ok(())
    }
}
