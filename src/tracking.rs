//! File-backed experiment tracking
//!
//! Layout under the tracking root:
//! `experiments/<experiment>/<run_id>/run.json`

use crate::error::{ChurnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Location of the tracking store, `file:<path>` or a bare path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingUri {
    root: PathBuf,
}

impl TrackingUri {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FromStr for TrackingUri {
    type Err = ChurnError;

    fn from_str(uri: &str) -> Result<Self> {
        let path = match uri.split_once(':') {
            Some(("file", rest)) => rest.trim_start_matches("//"),
            // Single-letter schemes are Windows drive prefixes
            Some((scheme, _)) if scheme.len() > 1 => {
                return Err(ChurnError::invalid_uri(
                    uri,
                    format!("unsupported scheme '{}', only file: is supported", scheme),
                ))
            }
            _ => uri,
        };

        if path.is_empty() {
            return Err(ChurnError::invalid_uri(uri, "empty path"));
        }
        Ok(Self {
            root: PathBuf::from(path),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

/// Persisted record of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub experiment: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

/// Experiment tracking store rooted at a directory
#[derive(Debug, Clone)]
pub struct Tracker {
    root: PathBuf,
}

impl Tracker {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn from_uri(uri: &TrackingUri) -> Self {
        Self::new(uri.root())
    }

    fn experiment_dir(&self, experiment: &str) -> PathBuf {
        self.root.join("experiments").join(experiment)
    }

    /// Open a new run in an experiment and persist it as running
    pub fn start_run(&self, experiment: &str) -> Result<ActiveRun> {
        let record = RunRecord {
            run_id: Uuid::new_v4().simple().to_string(),
            experiment: experiment.to_string(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
        };
        let dir = self.experiment_dir(experiment).join(&record.run_id);
        fs::create_dir_all(&dir)?;

        let run = ActiveRun { dir, record };
        run.flush()?;
        info!("Started run {} in experiment '{}'", run.id(), experiment);
        Ok(run)
    }

    /// All runs recorded for an experiment, oldest first
    pub fn runs(&self, experiment: &str) -> Result<Vec<RunRecord>> {
        let dir = self.experiment_dir(experiment);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path().join("run.json");
            if path.is_file() {
                runs.push(serde_json::from_str(&fs::read_to_string(path)?)?);
            }
        }
        runs.sort_by(|a: &RunRecord, b: &RunRecord| a.start_time.cmp(&b.start_time));
        Ok(runs)
    }
}

/// A run in progress; every change is written through to disk
#[derive(Debug)]
pub struct ActiveRun {
    dir: PathBuf,
    record: RunRecord,
}

impl ActiveRun {
    pub fn id(&self) -> &str {
        &self.record.run_id
    }

    pub fn log_param<V: ToString>(&mut self, key: &str, value: V) -> Result<()> {
        self.record.params.insert(key.to_string(), value.to_string());
        self.flush()
    }

    pub fn log_metric(&mut self, key: &str, value: f64) -> Result<()> {
        self.record.metrics.insert(key.to_string(), value);
        self.flush()
    }

    /// Close the run with a final status
    pub fn finish(mut self, status: RunStatus) -> Result<RunRecord> {
        self.record.status = status;
        self.record.end_time = Some(Utc::now());
        self.flush()?;
        debug!("Run {} closed as {:?}", self.record.run_id, status);
        Ok(self.record)
    }

    fn flush(&self) -> Result<()> {
        let path = self.dir.join("run.json");
        let tmp = self.dir.join("run.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.record)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_tracking_uri() {
        let uri: TrackingUri = "file:mlruns".parse().unwrap();
        assert_eq!(uri.root(), Path::new("mlruns"));

        let uri: TrackingUri = "file:///tmp/store".parse().unwrap();
        assert_eq!(uri.root(), Path::new("/tmp/store"));

        let uri: TrackingUri = "./local".parse().unwrap();
        assert_eq!(uri.root(), Path::new("./local"));

        assert!("sqlite:///mlflow.db".parse::<TrackingUri>().is_err());
        assert!("file:".parse::<TrackingUri>().is_err());
    }

    #[test]
    fn test_run_lifecycle_persisted() {
        let dir = tempdir().unwrap();
        let tracker = Tracker::new(dir.path());

        let mut run = tracker.start_run("telco-churn").unwrap();
        run.log_param("model", "RandomForestClassifier").unwrap();
        run.log_metric("accuracy", 0.8).unwrap();
        let run_id = run.id().to_string();
        let record = run.finish(RunStatus::Finished).unwrap();

        assert_eq!(record.status, RunStatus::Finished);
        assert!(record.end_time.is_some());

        let runs = tracker.runs("telco-churn").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run_id);
        assert_eq!(runs[0].params["model"], "RandomForestClassifier");
        assert_eq!(runs[0].metrics["accuracy"], 0.8);
    }

    #[test]
    fn test_tracker_from_uri_writes_under_root() {
        let dir = tempdir().unwrap();
        let uri: TrackingUri = format!("file:{}", dir.path().display()).parse().unwrap();

        let run = Tracker::from_uri(&uri).start_run("telco-churn").unwrap();
        let path = dir
            .path()
            .join("experiments/telco-churn")
            .join(run.id())
            .join("run.json");
        assert!(path.is_file());
    }

    #[test]
    fn test_runs_of_unknown_experiment_is_empty() {
        let dir = tempdir().unwrap();
        assert!(Tracker::new(dir.path()).runs("nothing").unwrap().is_empty());
    }
}
