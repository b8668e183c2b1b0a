//! Raw data cleaning using Polars

use crate::error::{ChurnError, Result};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, info};

/// Identifier column dropped before modelling
pub const ID_COLUMN: &str = "customerID";
/// Billing column that must parse as a number
pub const CHARGES_COLUMN: &str = "TotalCharges";
/// Binary target column
pub const LABEL_COLUMN: &str = "Churn";
/// Raw label value mapped to 1
pub const POSITIVE_LABEL: &str = "Yes";
/// Raw label value mapped to 0
pub const NEGATIVE_LABEL: &str = "No";

/// Summary of a cleaning run, printed to the console
#[derive(Debug, Clone, PartialEq)]
pub struct CleanSummary {
    /// Rows in the cleaned table
    pub rows: usize,
    /// Columns in the cleaned table
    pub columns: usize,
    /// Rows removed because the charges column did not parse
    pub dropped_rows: usize,
    /// Label value and its share of the rows, most frequent first
    pub label_distribution: Option<Vec<(i64, f64)>>,
}

impl CleanSummary {
    /// Build a summary from a cleaned frame
    pub fn from_frame(df: &DataFrame, dropped_rows: usize) -> Result<Self> {
        let label_distribution = if has_column(df, LABEL_COLUMN) {
            Some(label_distribution(df.column(LABEL_COLUMN)?)?)
        } else {
            None
        };

        Ok(Self {
            rows: df.height(),
            columns: df.width(),
            dropped_rows,
            label_distribution,
        })
    }
}

impl fmt::Display for CleanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rows: {} | Columns: {}", self.rows, self.columns)?;
        if let Some(dist) = &self.label_distribution {
            let parts: Vec<String> = dist
                .iter()
                .map(|(label, share)| format!("{}: {}", label, share))
                .collect();
            write!(f, "\n{} distribution: {{{}}}", LABEL_COLUMN, parts.join(", "))?;
        }
        Ok(())
    }
}

/// Normalize a header name: trim surrounding whitespace, interior spaces become underscores
pub fn normalize_column_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Read a comma-delimited file with a header row
///
/// Types are inferred from the whole file so a late blank cell in a numeric
/// column yields a text column instead of a parse failure.
pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))?
        .finish()?;
    Ok(df)
}

/// Write a frame as CSV with a header and no index column, creating parent directories
pub fn write_csv<P: AsRef<Path>>(df: &mut DataFrame, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Apply the cleaning steps to a raw frame
///
/// Each step is skipped when its column is absent.
///
/// # Arguments
/// * `df` - Raw frame as read from disk
///
/// # Returns
/// * Cleaned frame, or `UnknownLabel` if the label column holds an unrecognized value
pub fn clean_frame(mut df: DataFrame) -> Result<DataFrame> {
    normalize_columns(&mut df)?;

    if has_column(&df, ID_COLUMN) {
        df = df.drop(ID_COLUMN)?;
        debug!("Dropped identifier column {}", ID_COLUMN);
    }

    if has_column(&df, CHARGES_COLUMN) {
        let parsed = parse_numeric(df.column(CHARGES_COLUMN)?)?;
        df.with_column(parsed)?;

        let before = df.height();
        let mask = df.column(CHARGES_COLUMN)?.is_not_null();
        df = df.filter(&mask)?;
        let dropped = before - df.height();
        if dropped > 0 {
            info!("Dropped {} rows with unparseable {}", dropped, CHARGES_COLUMN);
        }
    }

    if has_column(&df, LABEL_COLUMN) {
        let labels = binarize_labels(df.column(LABEL_COLUMN)?)?;
        df.with_column(Series::new(LABEL_COLUMN, labels))?;
    }

    Ok(df)
}

/// Clean a raw CSV file and write the result
///
/// # Arguments
/// * `infile` - Raw CSV path
/// * `outfile` - Destination path, overwritten if present
///
/// # Returns
/// * `CleanSummary` describing the written table
pub fn clean_file<P: AsRef<Path>, Q: AsRef<Path>>(infile: P, outfile: Q) -> Result<CleanSummary> {
    let raw = read_csv(&infile)?;
    let raw_rows = raw.height();
    info!(
        "Loaded {} rows x {} columns from {}",
        raw_rows,
        raw.width(),
        infile.as_ref().display()
    );

    let mut cleaned = clean_frame(raw)?;
    write_csv(&mut cleaned, &outfile)?;
    info!("Wrote cleaned data to {}", outfile.as_ref().display());

    CleanSummary::from_frame(&cleaned, raw_rows - cleaned.height())
}

/// Whether the frame carries a column with this exact name
pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok()
}

fn normalize_columns(df: &mut DataFrame) -> Result<()> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    for name in names {
        let normalized = normalize_column_name(&name);
        if normalized != name {
            df.rename(&name, &normalized)?;
        }
    }
    Ok(())
}

/// Coerce a column to f64; cells that do not parse, and NaN, become null
fn parse_numeric(series: &Series) -> Result<Series> {
    let values: Vec<Option<f64>> = if series.dtype().is_numeric() {
        series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|cell| cell.filter(|value| !value.is_nan()))
            .collect()
    } else {
        series
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|cell| {
                cell.and_then(|text| text.trim().parse::<f64>().ok())
                    .filter(|value| !value.is_nan())
            })
            .collect()
    };
    Ok(Series::new(series.name(), values))
}

/// Map the label column to 0/1, failing on anything outside the recognized set
///
/// An integer column that already holds only 0 and 1 passes through unchanged.
fn binarize_labels(series: &Series) -> Result<Vec<i64>> {
    let column = series.name().to_string();
    let unknown = |value: String, row: usize| ChurnError::UnknownLabel {
        column: column.clone(),
        value,
        row,
    };

    if series.dtype().is_integer() {
        series
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .enumerate()
            .map(|(row, cell)| match cell {
                Some(value @ (0 | 1)) => Ok(value),
                Some(other) => Err(unknown(other.to_string(), row)),
                None => Err(unknown(String::new(), row)),
            })
            .collect()
    } else {
        series
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, cell)| match cell {
                Some(POSITIVE_LABEL) => Ok(1),
                Some(NEGATIVE_LABEL) => Ok(0),
                Some(other) => Err(unknown(other.to_string(), row)),
                None => Err(unknown(String::new(), row)),
            })
            .collect()
    }
}

/// Share of each label value rounded to 3 decimals, most frequent first
fn label_distribution(series: &Series) -> Result<Vec<(i64, f64)>> {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    let values = series.cast(&DataType::Int64)?;
    for value in values.i64()?.into_iter().flatten() {
        *counts.entry(value).or_insert(0) += 1;
    }

    let total: usize = counts.values().sum();
    let mut dist: Vec<(i64, usize)> = counts.into_iter().collect();
    dist.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    Ok(dist
        .into_iter()
        .map(|(label, count)| (label, round3(count as f64 / total as f64)))
        .collect())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
