//! Persisted feature schema and the columnar frames aligned to it
//!
//! The numeric/categorical partition is decided once, at training time, from the
//! stored column types. It travels with the trained pipeline and is the only
//! partition used when serving.

use crate::error::{ChurnError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// How a feature column is preprocessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Median imputation then standardization
    Numeric,
    /// Most-frequent imputation then one-hot encoding
    Categorical,
}

/// A named, typed feature column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

/// Ordered list of feature columns with their declared kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub columns: Vec<ColumnSpec>,
}

impl FeatureSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Names of the numeric columns in schema order
    pub fn numeric_columns(&self) -> Vec<&str> {
        self.names_of(ColumnKind::Numeric)
    }

    /// Names of the categorical columns in schema order
    pub fn categorical_columns(&self) -> Vec<&str> {
        self.names_of(ColumnKind::Categorical)
    }

    fn names_of(&self, kind: ColumnKind) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Values of one feature column; `None` marks a missing cell
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(values) => values.len(),
            ColumnData::Categorical(values) => values.len(),
        }
    }

    fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Numeric(values) => {
                ColumnData::Numeric(indices.iter().map(|&i| values[i]).collect())
            }
            ColumnData::Categorical(values) => {
                ColumnData::Categorical(indices.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }
}

/// Columnar feature table aligned to a [`FeatureSchema`]
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    schema: FeatureSchema,
    columns: Vec<ColumnData>,
    n_rows: usize,
}

impl FeatureFrame {
    /// Build a frame from columns, checking kinds and lengths against the schema
    pub fn new(schema: FeatureSchema, columns: Vec<ColumnData>) -> Result<Self> {
        if schema.len() != columns.len() {
            return Err(ChurnError::schema_mismatch(format!(
                "schema has {} columns, got {}",
                schema.len(),
                columns.len()
            )));
        }

        let n_rows = columns.first().map(ColumnData::len).unwrap_or(0);
        for (spec, data) in schema.columns.iter().zip(&columns) {
            let kind_matches = matches!(
                (spec.kind, data),
                (ColumnKind::Numeric, ColumnData::Numeric(_))
                    | (ColumnKind::Categorical, ColumnData::Categorical(_))
            );
            if !kind_matches {
                return Err(ChurnError::schema_mismatch(format!(
                    "column '{}' is declared {:?}",
                    spec.name, spec.kind
                )));
            }
            if data.len() != n_rows {
                return Err(ChurnError::schema_mismatch(format!(
                    "column '{}' has {} rows, expected {}",
                    spec.name,
                    data.len(),
                    n_rows
                )));
            }
        }

        Ok(Self {
            schema,
            columns,
            n_rows,
        })
    }

    /// Build a frame from a data frame, inferring the schema from stored types
    ///
    /// Integer and float columns become numeric; every other type is categorical.
    ///
    /// # Arguments
    /// * `df` - Source table
    /// * `exclude` - Columns left out of the features (the label)
    pub fn from_dataframe(df: &DataFrame, exclude: &[&str]) -> Result<Self> {
        let mut specs = Vec::new();
        for series in df.get_columns() {
            let name = series.name().to_string();
            if exclude.contains(&name.as_str()) {
                continue;
            }
            let kind = if series.dtype().is_numeric() {
                ColumnKind::Numeric
            } else {
                ColumnKind::Categorical
            };
            specs.push(ColumnSpec { name, kind });
        }

        Self::from_dataframe_with_schema(df, &FeatureSchema::new(specs))
    }

    /// Build a frame from a data frame using an existing schema
    pub fn from_dataframe_with_schema(df: &DataFrame, schema: &FeatureSchema) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.len());
        for spec in &schema.columns {
            let series = df.column(&spec.name).map_err(|_| ChurnError::MissingColumn {
                column: spec.name.clone(),
            })?;
            let data = match spec.kind {
                ColumnKind::Numeric => ColumnData::Numeric(
                    series
                        .cast(&DataType::Float64)?
                        .f64()?
                        .into_iter()
                        .map(|cell| cell.filter(|v| !v.is_nan()))
                        .collect(),
                ),
                ColumnKind::Categorical => ColumnData::Categorical(
                    series
                        .cast(&DataType::String)?
                        .str()?
                        .into_iter()
                        .map(|cell| cell.map(str::to_string))
                        .collect(),
                ),
            };
            columns.push(data);
        }

        Self::new(schema.clone(), columns)
    }

    /// Build a frame from named JSON records
    ///
    /// Absent or `null` fields are missing cells and fields outside the schema are
    /// ignored. Numeric columns accept numbers, booleans and numeric strings;
    /// categorical columns accept strings and stringify numbers and booleans.
    pub fn from_records(schema: &FeatureSchema, records: &[Map<String, Value>]) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.len());
        for spec in &schema.columns {
            let cells = records.iter().enumerate().map(|(index, record)| {
                (index, record.get(&spec.name).unwrap_or(&Value::Null))
            });
            let data = match spec.kind {
                ColumnKind::Numeric => ColumnData::Numeric(
                    cells
                        .map(|(index, value)| numeric_cell(&spec.name, index, value))
                        .collect::<Result<_>>()?,
                ),
                ColumnKind::Categorical => ColumnData::Categorical(
                    cells
                        .map(|(index, value)| categorical_cell(&spec.name, index, value))
                        .collect::<Result<_>>()?,
                ),
            };
            columns.push(data);
        }

        let mut frame = Self::new(schema.clone(), columns)?;
        frame.n_rows = records.len();
        Ok(frame)
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Select rows by position
    pub fn take(&self, indices: &[usize]) -> FeatureFrame {
        FeatureFrame {
            schema: self.schema.clone(),
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
            n_rows: indices.len(),
        }
    }

    /// Iterate `(spec, data)` pairs in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&ColumnSpec, &ColumnData)> {
        self.schema.columns.iter().zip(&self.columns)
    }
}

/// Read a 0/1 label column as class indices
pub fn extract_labels(df: &DataFrame, label: &str) -> Result<Vec<usize>> {
    let series = df.column(label).map_err(|_| ChurnError::MissingColumn {
        column: label.to_string(),
    })?;

    series
        .cast(&DataType::Int64)?
        .i64()?
        .into_iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            Some(0) => Ok(0),
            Some(1) => Ok(1),
            other => Err(ChurnError::UnknownLabel {
                column: label.to_string(),
                value: other.map(|v| v.to_string()).unwrap_or_default(),
                row,
            }),
        })
        .collect()
}

fn numeric_cell(column: &str, index: usize, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|v| Some(v).filter(|v| !v.is_nan()))
            .map_err(|_| ChurnError::InvalidRecord {
                index,
                message: format!("field '{}' expects a number, got {:?}", column, s),
            }),
        other => Err(ChurnError::InvalidRecord {
            index,
            message: format!("field '{}' expects a number, got {}", column, other),
        }),
    }
}

fn categorical_cell(column: &str, index: usize, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(ChurnError::InvalidRecord {
            index,
            message: format!("field '{}' expects a category, got {}", column, other),
        }),
    }
}
