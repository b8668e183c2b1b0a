//! Trained pipeline: persisted schema + fitted preprocessor + fitted forest

use crate::error::{ChurnError, Result};
use crate::forest::{ForestParams, RandomForest};
use crate::metrics::POSITIVE;
use crate::preprocess::{FittedPreprocessor, Preprocessor};
use crate::schema::{FeatureFrame, FeatureSchema};
use chrono::{DateTime, Utc};
use linfa::prelude::*;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Artifact layout version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Immutable fitted pipeline, the unit stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnPipeline {
    format_version: u32,
    trained_at: DateTime<Utc>,
    preprocessor: FittedPreprocessor,
    forest: RandomForest,
}

impl ChurnPipeline {
    /// Fit preprocessing and the forest on a training frame
    ///
    /// # Arguments
    /// * `frame` - Training features; its schema becomes the pipeline's schema
    /// * `labels` - Class index per row
    /// * `params` - Forest hyperparameters
    pub fn fit(frame: &FeatureFrame, labels: &[usize], params: ForestParams) -> Result<Self> {
        if frame.n_rows() != labels.len() {
            return Err(ChurnError::insufficient_data(format!(
                "{} feature rows but {} labels",
                frame.n_rows(),
                labels.len()
            )));
        }

        let preprocessor = Preprocessor::new().fit(frame)?;
        let features = preprocessor.transform(frame)?;
        info!(
            "Preprocessed {} rows into {} features",
            features.nrows(),
            features.ncols()
        );

        let dataset = Dataset::new(features, Array1::from(labels.to_vec()));
        let fitted: Result<RandomForest> = params.fit(&dataset);
        let forest = fitted?;

        Ok(Self {
            format_version: FORMAT_VERSION,
            trained_at: Utc::now(),
            preprocessor,
            forest,
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.preprocessor.schema()
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn preprocessor(&self) -> &FittedPreprocessor {
        &self.preprocessor
    }

    pub fn forest(&self) -> &RandomForest {
        &self.forest
    }

    /// Predicted class per row
    pub fn predict(&self, frame: &FeatureFrame) -> Result<Vec<usize>> {
        let features = self.preprocessor.transform(frame)?;
        self.check_width(features.ncols())?;
        Ok(self.forest.predict(&features).to_vec())
    }

    /// Positive-class score per row
    ///
    /// `None` when the forest never saw the positive class during training.
    pub fn predict_proba(&self, frame: &FeatureFrame) -> Result<Option<Vec<f64>>> {
        if self.forest.n_classes() <= POSITIVE {
            return Ok(None);
        }
        let features = self.preprocessor.transform(frame)?;
        self.check_width(features.ncols())?;
        let proba = self.forest.predict_proba(&features);
        Ok(Some(proba.column(POSITIVE).to_vec()))
    }

    fn check_width(&self, n_features: usize) -> Result<()> {
        if n_features != self.forest.n_features() {
            return Err(ChurnError::schema_mismatch(format!(
                "preprocessor produced {} features, forest expects {}",
                n_features,
                self.forest.n_features()
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let pipeline: Self = bincode::deserialize(bytes)?;
        if pipeline.format_version != FORMAT_VERSION {
            return Err(ChurnError::UnsupportedFormat {
                found: pipeline.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(pipeline)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
