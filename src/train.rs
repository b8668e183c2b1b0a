//! Trainer: stratified split, pipeline fit, evaluation, tracking and registration

use crate::data::{self, LABEL_COLUMN};
use crate::error::{ChurnError, Result};
use crate::forest::{ClassWeight, ForestParams};
use crate::metrics::Metrics;
use crate::pipeline::ChurnPipeline;
use crate::registry::{ModelRegistry, ModelVersion, Stage, DEFAULT_MODEL_NAME};
use crate::schema::{extract_labels, FeatureFrame};
use crate::tracking::{ActiveRun, RunStatus, Tracker};
use linfa::ParamGuard;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Experiment runs are recorded under by default
pub const DEFAULT_EXPERIMENT: &str = "telco-churn";

const MODEL_KIND: &str = "RandomForestClassifier";

/// Trainer configuration
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Fraction of each class held out for evaluation
    pub test_size: f64,
    /// Seed for the split; the forest carries its own seed
    pub seed: u64,
    pub forest: ForestParams,
    pub model_name: String,
    pub experiment: String,
    /// Stage to move the new version to after registration
    pub promote: Option<Stage>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            seed: 42,
            forest: ForestParams::default(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            experiment: DEFAULT_EXPERIMENT.to_string(),
            promote: None,
        }
    }
}

/// Row positions of the two halves of a split, each sorted ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Everything a training run produced
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub metrics: Metrics,
    pub run_id: String,
    pub model_version: ModelVersion,
    pub n_train: usize,
    pub n_test: usize,
    pub metrics_path: PathBuf,
    pub model_path: PathBuf,
    pub schema_path: PathBuf,
}

/// Split rows so each class keeps its share in both halves
///
/// Rows of each class are shuffled with a seeded RNG and
/// `round(test_size * class_count)` of them go to the test split.
///
/// # Arguments
/// * `labels` - Class index per row
/// * `test_size` - Fraction in (0, 1) held out
/// * `seed` - RNG seed; the same inputs always give the same split
pub fn stratified_split(labels: &[usize], test_size: f64, seed: u64) -> Result<Split> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(ChurnError::invalid_parameter(format!(
            "test_size must be in (0, 1), got {}",
            test_size
        )));
    }

    let n_classes = labels.iter().max().map_or(0, |&m| m + 1);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (row, &label) in labels.iter().enumerate() {
        by_class[label].push(row);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for mut rows in by_class {
        rows.shuffle(&mut rng);
        let n_test = (test_size * rows.len() as f64).round() as usize;
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();

    if train.is_empty() || test.is_empty() {
        return Err(ChurnError::insufficient_data(format!(
            "{} rows give {} training and {} test rows",
            labels.len(),
            train.len(),
            test.len()
        )));
    }
    Ok(Split { train, test })
}

/// Train, evaluate, persist and register a churn model
///
/// # Arguments
/// * `data_path` - Cleaned CSV with a 0/1 `Churn` column
/// * `out_dir` - Receives `metrics.json`, `model.bin` and `schema.json`
/// * `config` - Split and forest settings
/// * `tracker` - Store the run is recorded in
/// * `registry` - Store the trained pipeline is published to
///
/// # Returns
/// Metrics on the held-out split plus the run and registered version
pub fn train<P: AsRef<Path>, Q: AsRef<Path>>(
    data_path: P,
    out_dir: Q,
    config: &TrainConfig,
    tracker: &Tracker,
    registry: &dyn ModelRegistry,
) -> Result<TrainOutcome> {
    let df = data::read_csv(data_path.as_ref())?;
    if !data::has_column(&df, LABEL_COLUMN) {
        return Err(ChurnError::MissingColumn {
            column: LABEL_COLUMN.to_string(),
        });
    }

    let labels = extract_labels(&df, LABEL_COLUMN)?;
    let frame = FeatureFrame::from_dataframe(&df, &[LABEL_COLUMN])?;
    info!(
        "Loaded {} rows with {} feature columns ({} numeric, {} categorical)",
        frame.n_rows(),
        frame.schema().len(),
        frame.schema().numeric_columns().len(),
        frame.schema().categorical_columns().len()
    );

    let split = stratified_split(&labels, config.test_size, config.seed)?;
    config.forest.check_ref()?;

    let mut run = tracker.start_run(&config.experiment)?;
    match fit_and_record(&frame, &labels, &split, out_dir.as_ref(), config, &mut run, registry) {
        Ok(outcome) => {
            run.finish(RunStatus::Finished)?;
            Ok(outcome)
        }
        Err(err) => {
            warn!("Training run {} failed: {}", run.id(), err);
            if let Err(finish_err) = run.finish(RunStatus::Failed) {
                warn!("Could not mark run as failed: {}", finish_err);
            }
            Err(err)
        }
    }
}

fn fit_and_record(
    frame: &FeatureFrame,
    labels: &[usize],
    split: &Split,
    out_dir: &Path,
    config: &TrainConfig,
    run: &mut ActiveRun,
    registry: &dyn ModelRegistry,
) -> Result<TrainOutcome> {
    let forest = config.forest.check_ref()?;
    run.log_param("model", MODEL_KIND)?;
    run.log_param("test_size", config.test_size)?;
    run.log_param("random_state", config.seed)?;
    run.log_param("n_estimators", forest.n_trees())?;
    run.log_param(
        "max_depth",
        forest
            .max_depth()
            .map_or_else(|| "None".to_string(), |d| d.to_string()),
    )?;
    run.log_param(
        "class_weight",
        match forest.class_weight() {
            ClassWeight::Balanced => "balanced",
            ClassWeight::Uniform => "None",
        },
    )?;

    let train_frame = frame.take(&split.train);
    let train_labels: Vec<usize> = split.train.iter().map(|&i| labels[i]).collect();
    let test_frame = frame.take(&split.test);
    let test_labels: Vec<usize> = split.test.iter().map(|&i| labels[i]).collect();

    info!(
        "Fitting on {} rows, evaluating on {}",
        split.train.len(),
        split.test.len()
    );
    let pipeline = ChurnPipeline::fit(&train_frame, &train_labels, config.forest.clone())?;

    let predicted = pipeline.predict(&test_frame)?;
    let scores = match pipeline.predict_proba(&test_frame) {
        Ok(Some(scores)) => Some(scores),
        Ok(None) => {
            warn!("Model never saw the positive class; roc_auc omitted");
            None
        }
        Err(err) => {
            warn!("Probability scores unavailable ({}); roc_auc omitted", err);
            None
        }
    };
    let metrics = Metrics::evaluate(&test_labels, &predicted, scores.as_deref());

    fs::create_dir_all(out_dir)?;
    let metrics_path = out_dir.join("metrics.json");
    let model_path = out_dir.join("model.bin");
    let schema_path = out_dir.join("schema.json");
    fs::write(&metrics_path, serde_json::to_string_pretty(&metrics)?)?;
    pipeline.save_to_file(&model_path)?;
    pipeline.schema().save_json(&schema_path)?;
    info!("Wrote artifacts to {}", out_dir.display());

    for (key, value) in metrics.as_map() {
        run.log_metric(&key, value)?;
    }

    let mut model_version = registry.publish(&config.model_name, &pipeline, Some(run.id()))?;
    if let Some(stage) = config.promote {
        model_version = registry.transition(&config.model_name, model_version.version, stage)?;
    }

    Ok(TrainOutcome {
        metrics,
        run_id: run.id().to_string(),
        model_version,
        n_train: split.train.len(),
        n_test: split.test.len(),
        metrics_path,
        model_path,
        schema_path,
    })
}
