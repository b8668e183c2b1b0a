//! Model registry: versioned pipelines with lifecycle stages
//!
//! Models are addressed by `models:/<name>/<selector>` where the selector is a
//! stage name, `latest`, or a version number. [`FileRegistry`] keeps everything
//! under `<root>/models/<name>/`:
//!
//! ```text
//! registry.json      index of versions and their stages
//! v1/model.bin       pipeline artifact of version 1
//! v2/model.bin
//! ```

use crate::error::{ChurnError, Result};
use crate::pipeline::ChurnPipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

/// Name the trainer registers under and the service loads by default
pub const DEFAULT_MODEL_NAME: &str = "telco-churn";

/// Model the service loads when none is configured
pub const DEFAULT_MODEL_URI: &str = "models:/telco-churn/Production";

const URI_SCHEME: &str = "models:/";
const INDEX_FILE: &str = "registry.json";
const ARTIFACT_FILE: &str = "model.bin";

/// Lifecycle stage of a model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    /// Stages that only one version may hold at a time
    fn is_exclusive(self) -> bool {
        matches!(self, Stage::Staging | Stage::Production)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        };
        f.write_str(name)
    }
}

impl FromStr for Stage {
    type Err = ChurnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            _ => Err(ChurnError::invalid_parameter(format!(
                "unknown stage '{}', expected None, Staging, Production or Archived",
                s
            ))),
        }
    }
}

/// Which version of a model a URI points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Stage(Stage),
    Latest,
    Version(u32),
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Stage(stage) => write!(f, "{}", stage),
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Version(v) => write!(f, "{}", v),
        }
    }
}

/// `models:/<name>/<stage|latest|version>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUri {
    pub name: String,
    pub selector: VersionSelector,
}

impl ModelUri {
    pub fn new<S: Into<String>>(name: S, selector: VersionSelector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }
}

impl fmt::Display for ModelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", URI_SCHEME, self.name, self.selector)
    }
}

impl FromStr for ModelUri {
    type Err = ChurnError;

    fn from_str(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            ChurnError::invalid_uri(uri, "expected models:/<name>/<stage|version>")
        })?;
        let (name, selector) = rest
            .split_once('/')
            .ok_or_else(|| ChurnError::invalid_uri(uri, "missing stage or version"))?;

        if name.is_empty() || selector.is_empty() || selector.contains('/') {
            return Err(ChurnError::invalid_uri(
                uri,
                "expected models:/<name>/<stage|version>",
            ));
        }

        let selector = if selector.eq_ignore_ascii_case("latest") {
            VersionSelector::Latest
        } else if let Ok(version) = selector.parse::<u32>() {
            VersionSelector::Version(version)
        } else {
            let stage = selector.parse::<Stage>().map_err(|_| {
                ChurnError::invalid_uri(uri, format!("unknown stage '{}'", selector))
            })?;
            VersionSelector::Stage(stage)
        };

        Ok(Self::new(name, selector))
    }
}

/// Metadata of one registered version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub stage: Stage,
    /// Tracking run that produced the artifact
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Storage of versioned pipelines
///
/// Implementations are shared between request handlers, so they must be
/// usable from several threads.
pub trait ModelRegistry: Send + Sync {
    /// Register a pipeline as the next version of `name`, in stage `None`
    fn publish(
        &self,
        name: &str,
        pipeline: &ChurnPipeline,
        run_id: Option<&str>,
    ) -> Result<ModelVersion>;

    /// Load the version a URI points at
    fn resolve(&self, uri: &ModelUri) -> Result<(ModelVersion, ChurnPipeline)>;

    /// Move a version to a stage
    ///
    /// Moving into `Staging` or `Production` archives the version that held it.
    fn transition(&self, name: &str, version: u32, stage: Stage) -> Result<ModelVersion>;

    /// All versions of a model, oldest first
    fn versions(&self, name: &str) -> Result<Vec<ModelVersion>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryIndex {
    versions: Vec<ModelVersion>,
}

/// Directory-backed registry
#[derive(Debug)]
pub struct FileRegistry {
    root: PathBuf,
    // Serializes index read-modify-write cycles within the process
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join("models").join(name)
    }

    fn artifact_path(&self, name: &str, version: u32) -> PathBuf {
        self.model_dir(name)
            .join(format!("v{}", version))
            .join(ARTIFACT_FILE)
    }

    fn read_index(&self, name: &str) -> Result<RegistryIndex> {
        let path = self.model_dir(name).join(INDEX_FILE);
        if !path.exists() {
            return Ok(RegistryIndex::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_index(&self, name: &str, index: &RegistryIndex) -> Result<()> {
        let dir = self.model_dir(name);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(index)?)?;
        fs::rename(tmp, dir.join(INDEX_FILE))?;
        Ok(())
    }
}

impl ModelRegistry for FileRegistry {
    fn publish(
        &self,
        name: &str,
        pipeline: &ChurnPipeline,
        run_id: Option<&str>,
    ) -> Result<ModelVersion> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_index(name)?;
        let version = index.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;

        // Artifact first, so the index never names a missing file
        let artifact = self.artifact_path(name, version);
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent)?;
        }
        pipeline.save_to_file(&artifact)?;

        let entry = ModelVersion {
            name: name.to_string(),
            version,
            stage: Stage::None,
            run_id: run_id.map(str::to_string),
            created_at: Utc::now(),
        };
        index.versions.push(entry.clone());
        self.write_index(name, &index)?;

        info!("Registered {} version {}", name, version);
        Ok(entry)
    }

    fn resolve(&self, uri: &ModelUri) -> Result<(ModelVersion, ChurnPipeline)> {
        let index = self.read_index(&uri.name)?;
        let found = match uri.selector {
            VersionSelector::Version(v) => index.versions.iter().find(|m| m.version == v),
            VersionSelector::Latest => index.versions.iter().max_by_key(|m| m.version),
            VersionSelector::Stage(stage) => index
                .versions
                .iter()
                .filter(|m| m.stage == stage)
                .max_by_key(|m| m.version),
        };
        let entry = found
            .cloned()
            .ok_or_else(|| ChurnError::model_not_found(format!("no version matches {}", uri)))?;

        let pipeline = ChurnPipeline::load_from_file(self.artifact_path(&uri.name, entry.version))?;
        Ok((entry, pipeline))
    }

    fn transition(&self, name: &str, version: u32, stage: Stage) -> Result<ModelVersion> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_index(name)?;
        if !index.versions.iter().any(|m| m.version == version) {
            return Err(ChurnError::model_not_found(format!(
                "{} has no version {}",
                name, version
            )));
        }

        for entry in index.versions.iter_mut() {
            if entry.version == version {
                entry.stage = stage;
            } else if stage.is_exclusive() && entry.stage == stage {
                info!("Archiving {} version {} (was {})", name, entry.version, stage);
                entry.stage = Stage::Archived;
            }
        }
        self.write_index(name, &index)?;

        info!("Moved {} version {} to {}", name, version, stage);
        index
            .versions
            .into_iter()
            .find(|m| m.version == version)
            .ok_or_else(|| ChurnError::model_not_found(format!("{} version {}", name, version)))
    }

    fn versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = self.read_index(name)?.versions;
        versions.sort_by_key(|m| m.version);
        Ok(versions)
    }
}
