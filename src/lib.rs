//! churnforge: customer churn prediction pipeline
//!
//! Three stages share this library: the cleaner normalizes the raw customer
//! export, the trainer fits and registers a random-forest pipeline, and the
//! service answers prediction requests with a registered model.

pub mod cli;
pub mod data;
pub mod error;
pub mod forest;
pub mod metrics;
pub mod pipeline;
pub mod preprocess;
pub mod registry;
pub mod schema;
pub mod service;
pub mod tracking;
pub mod train;

// Re-export public items for easier access
pub use data::{clean_file, clean_frame, CleanSummary};
pub use error::{ChurnError, Result};
pub use forest::{ForestParams, RandomForest};
pub use metrics::Metrics;
pub use pipeline::ChurnPipeline;
pub use registry::{FileRegistry, ModelRegistry, ModelUri, Stage};
pub use schema::{FeatureFrame, FeatureSchema};
pub use train::{stratified_split, train, TrainConfig, TrainOutcome};
