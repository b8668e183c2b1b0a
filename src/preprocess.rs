//! Column transformer: impute + scale numeric columns, impute + one-hot categorical columns
//!
//! Numeric features come first in the output matrix, followed by one indicator
//! block per categorical column, both in schema order.

use crate::error::{ChurnError, Result};
use crate::schema::{ColumnData, FeatureFrame, FeatureSchema};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Learned parameters for one numeric column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub name: String,
    /// Median of the observed values, used for missing cells
    pub fill: f64,
    pub mean: f64,
    /// Population standard deviation, 1.0 when the column is constant
    pub scale: f64,
}

/// Learned parameters for one categorical column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalStats {
    pub name: String,
    /// Most frequent observed value, used for missing cells
    pub fill: String,
    /// Sorted categories seen during fit; one output column each
    pub categories: Vec<String>,
}

/// Unfitted preprocessor
#[derive(Debug, Clone, Default)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Learn imputation, scaling and encoding parameters from a training frame
    pub fn fit(&self, frame: &FeatureFrame) -> Result<FittedPreprocessor> {
        if frame.n_rows() == 0 {
            return Err(ChurnError::insufficient_data(
                "cannot fit preprocessor on an empty frame",
            ));
        }

        let mut numeric = Vec::new();
        let mut categorical = Vec::new();

        for (spec, data) in frame.iter() {
            match data {
                ColumnData::Numeric(values) => numeric.push(fit_numeric(&spec.name, values)),
                ColumnData::Categorical(values) => {
                    categorical.push(fit_categorical(&spec.name, values))
                }
            }
        }

        let n_features_out =
            numeric.len() + categorical.iter().map(|c| c.categories.len()).sum::<usize>();

        Ok(FittedPreprocessor {
            schema: frame.schema().clone(),
            numeric,
            categorical,
            n_features_out,
        })
    }
}

/// Fitted preprocessor ready to transform serving data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessor {
    schema: FeatureSchema,
    numeric: Vec<NumericStats>,
    categorical: Vec<CategoricalStats>,
    n_features_out: usize,
}

impl FittedPreprocessor {
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn numeric(&self) -> &[NumericStats] {
        &self.numeric
    }

    pub fn categorical(&self) -> &[CategoricalStats] {
        &self.categorical
    }

    pub fn n_features_out(&self) -> usize {
        self.n_features_out
    }

    /// Output column names: numeric names, then `column=category` indicators
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.numeric.iter().map(|n| n.name.clone()).collect();
        for cat in &self.categorical {
            names.extend(cat.categories.iter().map(|c| format!("{}={}", cat.name, c)));
        }
        names
    }

    /// Transform a frame into the model's input matrix
    ///
    /// Categories not seen during fit encode as all zeros.
    ///
    /// # Errors
    /// `SchemaMismatch` when the frame was built from a different schema.
    pub fn transform(&self, frame: &FeatureFrame) -> Result<Array2<f64>> {
        if frame.schema() != &self.schema {
            return Err(ChurnError::schema_mismatch(format!(
                "expected columns {:?}, got {:?}",
                column_list(&self.schema),
                column_list(frame.schema())
            )));
        }

        let n_rows = frame.n_rows();
        let mut out = Array2::<f64>::zeros((n_rows, self.n_features_out));
        let mut numeric_stats = self.numeric.iter();
        let mut categorical_stats = self.categorical.iter();
        let mut numeric_col = 0;
        let mut onehot_offset = self.numeric.len();

        for (_, data) in frame.iter() {
            match data {
                ColumnData::Numeric(values) => {
                    let stats = numeric_stats
                        .next()
                        .ok_or_else(|| ChurnError::schema_mismatch("numeric column count"))?;
                    for (row, cell) in values.iter().enumerate() {
                        let value = cell.unwrap_or(stats.fill);
                        out[[row, numeric_col]] = (value - stats.mean) / stats.scale;
                    }
                    numeric_col += 1;
                }
                ColumnData::Categorical(values) => {
                    let stats = categorical_stats
                        .next()
                        .ok_or_else(|| ChurnError::schema_mismatch("categorical column count"))?;
                    for (row, cell) in values.iter().enumerate() {
                        let value = cell.as_deref().unwrap_or(&stats.fill);
                        if let Ok(idx) = stats
                            .categories
                            .binary_search_by(|c| c.as_str().cmp(value))
                        {
                            out[[row, onehot_offset + idx]] = 1.0;
                        }
                    }
                    onehot_offset += stats.categories.len();
                }
            }
        }

        Ok(out)
    }
}

fn column_list(schema: &FeatureSchema) -> Vec<String> {
    schema
        .columns
        .iter()
        .map(|c| format!("{}:{:?}", c.name, c.kind))
        .collect()
}

fn fit_numeric(name: &str, values: &[Option<f64>]) -> NumericStats {
    let mut observed: Vec<f64> = values.iter().flatten().copied().collect();
    observed.sort_by(|a, b| a.total_cmp(b));
    let fill = median(&observed).unwrap_or(0.0);

    let n = values.len() as f64;
    let imputed = values.iter().map(|v| v.unwrap_or(fill));
    let mean = imputed.clone().sum::<f64>() / n;
    let variance = imputed.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    let scale = if std > f64::EPSILON { std } else { 1.0 };

    NumericStats {
        name: name.to_string(),
        fill,
        mean,
        scale,
    }
}

fn fit_categorical(name: &str, values: &[Option<String>]) -> CategoricalStats {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values.iter().flatten() {
        *counts.entry(value.as_str()).or_insert(0) += 1;
    }

    // Ties go to the lexicographically smallest value.
    let mut fill = "";
    let mut best = 0;
    for (&value, &count) in &counts {
        if count > best {
            fill = value;
            best = count;
        }
    }
    let fill = fill.to_string();

    let mut categories: Vec<String> = counts.keys().map(|k| k.to_string()).collect();
    if values.iter().any(Option::is_none) && !counts.contains_key(fill.as_str()) {
        categories.push(fill.clone());
        categories.sort();
    }

    CategoricalStats {
        name: name.to_string(),
        fill,
        categories,
    }
}

/// Median of sorted values
fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    Some(if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnKind, ColumnSpec};

    fn frame(numeric: Vec<Option<f64>>, categorical: Vec<Option<&str>>) -> FeatureFrame {
        let schema = FeatureSchema::new(vec![
            ColumnSpec {
                name: "tenure".to_string(),
                kind: ColumnKind::Numeric,
            },
            ColumnSpec {
                name: "Contract".to_string(),
                kind: ColumnKind::Categorical,
            },
        ]);
        FeatureFrame::new(
            schema,
            vec![
                ColumnData::Numeric(numeric),
                ColumnData::Categorical(
                    categorical.into_iter().map(|c| c.map(str::to_string)).collect(),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_median_imputation_and_scaling() {
        // Median of [1, 3, 5] = 3; imputed column [1, 3, 3, 5]
        let train = frame(
            vec![Some(1.0), None, Some(3.0), Some(5.0)],
            vec![Some("a"), Some("a"), Some("b"), Some("a")],
        );
        let fitted = Preprocessor::new().fit(&train).unwrap();
        let stats = &fitted.numeric()[0];

        assert!((stats.fill - 3.0).abs() < 1e-12);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.scale - 2.0f64.sqrt()).abs() < 1e-12);

        let out = fitted.transform(&train).unwrap();
        let column = out.column(0);
        let mean = column.sum() / 4.0;
        assert!(mean.abs() < 1e-12);
        assert!(column[1].abs() < 1e-12);
    }

    #[test]
    fn test_most_frequent_imputation_and_one_hot() {
        let train = frame(
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)],
            vec![Some("Two year"), None, Some("Month-to-month"), Some("Two year")],
        );
        let fitted = Preprocessor::new().fit(&train).unwrap();

        assert_eq!(fitted.categorical()[0].fill, "Two year");
        assert_eq!(
            fitted.feature_names(),
            vec!["tenure", "Contract=Month-to-month", "Contract=Two year"]
        );

        let out = fitted.transform(&train).unwrap();
        assert_eq!(out.shape(), &[4, 3]);
        assert_eq!(out.row(1).to_vec()[1..], [0.0, 1.0]);
        assert_eq!(out.row(2).to_vec()[1..], [1.0, 0.0]);
    }

    #[test]
    fn test_unseen_category_encodes_as_zeros() {
        let train = frame(vec![Some(1.0), Some(2.0)], vec![Some("a"), Some("b")]);
        let fitted = Preprocessor::new().fit(&train).unwrap();

        let serving = frame(vec![Some(1.5)], vec![Some("never-seen")]);
        let out = fitted.transform(&serving).unwrap();
        assert_eq!(out.row(0).to_vec()[1..], [0.0, 0.0]);
    }

    #[test]
    fn test_served_nan_transforms_like_null() {
        let train = frame(vec![Some(1.0), Some(3.0)], vec![Some("a"), Some("b")]);
        let fitted = Preprocessor::new().fit(&train).unwrap();

        let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::json!([
            {"tenure": "NaN", "Contract": "a"},
            {"tenure": null, "Contract": "a"}
        ])
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect();
        let serving = FeatureFrame::from_records(fitted.schema(), &rows).unwrap();
        let out = fitted.transform(&serving).unwrap();

        assert!(out.iter().all(|v| v.is_finite()));
        assert_eq!(out.row(0), out.row(1));
        assert_eq!(out[[0, 0]], 0.0);
    }

    #[test]
    fn test_constant_column_uses_unit_scale() {
        let train = frame(vec![Some(7.0), Some(7.0)], vec![Some("a"), Some("a")]);
        let fitted = Preprocessor::new().fit(&train).unwrap();
        assert_eq!(fitted.numeric()[0].scale, 1.0);

        let out = fitted.transform(&train).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let train = frame(vec![Some(1.0)], vec![Some("a")]);
        let fitted = Preprocessor::new().fit(&train).unwrap();

        let other = FeatureFrame::new(
            FeatureSchema::new(vec![ColumnSpec {
                name: "tenure".to_string(),
                kind: ColumnKind::Numeric,
            }]),
            vec![ColumnData::Numeric(vec![Some(1.0)])],
        )
        .unwrap();
        assert!(matches!(
            fitted.transform(&other),
            Err(ChurnError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_fit_on_empty_frame_fails() {
        let empty = frame(vec![], vec![]);
        assert!(Preprocessor::new().fit(&empty).is_err());
    }
}
