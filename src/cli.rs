//! Command-line interface definitions and argument parsing

use crate::error::Result;
use crate::forest::ForestParams;
use crate::registry::{ModelUri, Stage, DEFAULT_MODEL_NAME, DEFAULT_MODEL_URI};
use crate::service::ServeConfig;
use crate::tracking::TrackingUri;
use crate::train::{TrainConfig, DEFAULT_EXPERIMENT};
use clap::{Parser, Subcommand};

/// Customer churn pipeline: clean the raw export, train a model, serve predictions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Tracking and registry store, `file:<path>` or a plain path
    #[arg(long, global = true, env = "CHURNFORGE_TRACKING_URI", default_value = "file:mlruns")]
    pub tracking_uri: String,

    /// Experiment that training runs are recorded under
    #[arg(long, global = true, env = "CHURNFORGE_EXPERIMENT", default_value = DEFAULT_EXPERIMENT)]
    pub experiment: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Normalize the raw CSV export into the training table
    Clean {
        /// Raw CSV export
        #[arg(long, default_value = "data/raw/Telco-Customer-Churn.csv")]
        infile: String,

        /// Destination of the cleaned CSV
        #[arg(long, default_value = "data/processed/telco_clean.csv")]
        outfile: String,
    },

    /// Fit, evaluate and register a churn model
    Train(TrainArgs),

    /// Run the HTTP prediction service
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8000")]
        bind: String,

        /// Registry model to load, `models:/<name>/<stage|latest|version>`
        #[arg(long, default_value = DEFAULT_MODEL_URI)]
        model_uri: String,
    },

    /// Move a registered version to a stage
    Promote {
        /// Version number to move
        #[arg(long)]
        version: u32,

        /// Target stage: None, Staging, Production or Archived
        #[arg(long)]
        stage: String,

        /// Registered model name
        #[arg(long, default_value = DEFAULT_MODEL_NAME)]
        name: String,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct TrainArgs {
    /// Cleaned CSV with a 0/1 Churn column
    #[arg(long, default_value = "data/processed/telco_clean.csv")]
    pub data: String,

    /// Directory for metrics.json, model.bin and schema.json
    #[arg(long, default_value = "artifacts")]
    pub out: String,

    /// Fraction of each class held out for evaluation
    #[arg(long, default_value = "0.2")]
    pub test_size: f64,

    /// Seed for the split and the forest
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Number of trees
    #[arg(long, default_value = "300")]
    pub n_estimators: usize,

    /// Maximum tree depth
    #[arg(long, default_value = "8")]
    pub max_depth: usize,

    /// Stage to move the new version to after registration
    #[arg(long)]
    pub promote: Option<String>,
}

impl Args {
    /// Parse the tracking URI
    pub fn parse_tracking_uri(&self) -> Result<TrackingUri> {
        self.tracking_uri.parse()
    }
}

impl TrainArgs {
    /// Build the trainer configuration
    ///
    /// # Arguments
    /// * `experiment` - Experiment name from the global options
    pub fn to_config(&self, experiment: &str) -> Result<TrainConfig> {
        let promote = self.promote.as_deref().map(parse_stage).transpose()?;
        let forest = ForestParams::new()
            .n_trees(self.n_estimators)
            .max_depth(Some(self.max_depth))
            .seed(self.seed);

        Ok(TrainConfig {
            test_size: self.test_size,
            seed: self.seed,
            forest,
            experiment: experiment.to_string(),
            promote,
            ..TrainConfig::default()
        })
    }
}

/// Build the service configuration from `serve` options
pub fn serve_config(bind: &str, model_uri: &str) -> Result<ServeConfig> {
    Ok(ServeConfig::new(bind, model_uri.parse::<ModelUri>()?))
}

/// Parse a stage name given on the command line
pub fn parse_stage(stage: &str) -> Result<Stage> {
    stage.parse()
}
