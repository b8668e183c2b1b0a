//! Error types shared by the cleaning, training and serving stages

use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, ChurnError>;

/// Main error type for churnforge
#[derive(Error, Debug)]
pub enum ChurnError {
    /// File system failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reading, writing or column access failures
    #[error("Data frame error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON encoding of metrics, schemas and registry metadata
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding of the pipeline artifact
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Estimator framework errors
    #[error("Model error: {0}")]
    Linfa(#[from] linfa::Error),

    /// A required column is absent from the input
    #[error("Required column '{column}' not found; run the clean step first")]
    MissingColumn {
        /// Name of the missing column
        column: String,
    },

    /// A label cell holds a value outside the recognized set
    #[error("Unrecognized value {value:?} in label column '{column}' at row {row}")]
    UnknownLabel {
        /// Label column name
        column: String,
        /// Offending value (empty for a missing cell)
        value: String,
        /// Zero-based data row
        row: usize,
    },

    /// Serving data does not match the schema the pipeline was fitted with
    #[error("Schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the difference
        message: String,
    },

    /// A prediction record could not be converted to the feature schema
    #[error("Invalid record {index}: {message}")]
    InvalidRecord {
        /// Position of the record in the request
        index: usize,
        /// What was wrong with it
        message: String,
    },

    /// Not enough rows to split or fit
    #[error("Insufficient data: {message}")]
    InsufficientData {
        /// Description of the shortfall
        message: String,
    },

    /// Rejected hyperparameter or configuration value
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the invalid value
        message: String,
    },

    /// The registry has no version matching a request
    #[error("Model not found: {message}")]
    ModelNotFound {
        /// Lookup that failed
        message: String,
    },

    /// Malformed model or tracking URI
    #[error("Invalid URI '{uri}': {message}")]
    InvalidUri {
        /// The URI as given
        uri: String,
        /// Why it was rejected
        message: String,
    },

    /// Artifact written by an incompatible version
    #[error("Unsupported artifact format version {found} (expected {expected})")]
    UnsupportedFormat {
        /// Version found in the artifact
        found: u32,
        /// Version this build reads
        expected: u32,
    },
}

impl ChurnError {
    /// Create an invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an insufficient data error
    pub fn insufficient_data<S: Into<String>>(message: S) -> Self {
        Self::InsufficientData {
            message: message.into(),
        }
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch<S: Into<String>>(message: S) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Create a model not found error
    pub fn model_not_found<S: Into<String>>(message: S) -> Self {
        Self::ModelNotFound {
            message: message.into(),
        }
    }

    /// Create an invalid URI error
    pub fn invalid_uri<U: Into<String>, S: Into<String>>(uri: U, message: S) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            message: message.into(),
        }
    }
}
