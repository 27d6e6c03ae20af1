//! # Module: config
//!
//! TOML configuration for one deployment of the pipeline.  Every field has a
//! default, so an empty file is a valid configuration; [`PipelineConfig::validate`]
//! rejects values the cycle cannot run with.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{ParamGrid, ParamValue};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Cluster-count discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Registered name of the clustering model.
    pub model_name: String,
    /// Largest cluster count tested by the elbow search.
    pub max_k: usize,
    /// Relative WCSS improvement below which adding clusters stops paying off.
    pub min_improvement: f64,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            model_name: "KMeans".into(),
            max_k: 10,
            min_improvement: 0.05,
            max_iter: 300,
            seed: 42,
        }
    }
}

/// Which built-in implementation backs a configured model type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    NearestCentroid,
    KNearest,
}

/// One model type trained for every cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model-type name; registered as `"<name><cluster>"`.
    pub name: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub grid: ParamGrid,
}

/// Per-cluster training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fraction of each cluster held out for scoring.
    pub test_fraction: f64,
    /// Seed of the train/test shuffle.
    pub seed: u64,
    /// Folds of the cross-validated grid search.
    pub cv_folds: usize,
    /// Train clusters on a rayon pool instead of sequentially.
    pub parallel: bool,
    pub models: Vec<ModelSpec>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.33,
            seed: 355,
            cv_folds: 3,
            parallel: false,
            models: vec![
                ModelSpec {
                    name: "NearestCentroid".into(),
                    kind: ModelKind::NearestCentroid,
                    grid: ParamGrid::new().with(
                        "metric",
                        vec![ParamValue::Text("euclidean".into()), ParamValue::Text("manhattan".into())],
                    ),
                },
                ModelSpec {
                    name: "KNearest".into(),
                    kind: ModelKind::KNearest,
                    grid: ParamGrid::new()
                        .with("k", vec![ParamValue::Int(1), ParamValue::Int(3), ParamValue::Int(5)])
                        .with(
                            "weights",
                            vec![ParamValue::Text("uniform".into()), ParamValue::Text("distance".into())],
                        ),
                },
            ],
        }
    }
}

/// How exact score ties between model types are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The lexicographically largest metric key wins.
    #[default]
    HighestKey,
    /// The lexicographically smallest metric key wins.
    LowestKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub tie_break: TieBreak,
}

/// Artifact store layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem store.
    pub root: PathBuf,
    pub models_dir: String,
    pub feature_store: String,
    /// Key of the raw training table.
    pub training_table: String,
    /// Key of the elbow-selection audit artifact.
    pub elbow_artifact: String,
    /// File extension of serialised models.
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            models_dir: "models".into(),
            feature_store: "feature_store".into(),
            training_table: "feature_store/training".into(),
            elbow_artifact: "io_files/elbow_curve.json".into(),
            format: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Experiment registry connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Database file for the SQLite backend.
    pub path: PathBuf,
    pub experiment: String,
    /// Prefix of every run name; the cluster index is appended.
    pub run_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            path: PathBuf::from("registry.db"),
            experiment: "cluster-training".into(),
            run_name: "train".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub clustering: ClusteringConfig,
    pub training: TrainingConfig,
    pub promotion: PromotionConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> PipelineResult<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML (used by `init-config`).
    pub fn to_toml_string(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let c = &self.clustering;
        if c.model_name.is_empty() {
            return invalid("clustering.model_name must not be empty");
        }
        if c.max_k == 0 {
            return invalid("clustering.max_k must be >= 1");
        }
        if !(c.min_improvement > 0.0 && c.min_improvement < 1.0) {
            return invalid(format!("clustering.min_improvement must be in (0, 1), got {}", c.min_improvement));
        }
        if c.max_iter == 0 {
            return invalid("clustering.max_iter must be >= 1");
        }

        let t = &self.training;
        if !(t.test_fraction > 0.0 && t.test_fraction < 1.0) {
            return invalid(format!("training.test_fraction must be in (0, 1), got {}", t.test_fraction));
        }
        if t.cv_folds < 2 {
            return invalid("training.cv_folds must be >= 2");
        }
        if t.models.is_empty() {
            return invalid("training.models must declare at least one model type");
        }
        let mut seen = HashSet::new();
        for m in &t.models {
            if m.name.is_empty() {
                return invalid("model names must not be empty");
            }
            if m.name.ends_with(|ch: char| ch.is_ascii_digit()) {
                return invalid(format!("model name '{}' must not end in a digit", m.name));
            }
            if m.name == c.model_name {
                return invalid(format!("model name '{}' collides with the clustering model", m.name));
            }
            if !seen.insert(m.name.as_str()) {
                return invalid(format!("duplicate model name '{}'", m.name));
            }
            if let Some((param, _)) = m.grid.0.iter().find(|(_, values)| values.is_empty()) {
                return invalid(format!("grid of '{}' declares '{}' with no values", m.name, param));
            }
        }

        let s = &self.storage;
        if s.format.is_empty() || s.models_dir.is_empty() || s.feature_store.is_empty() {
            return invalid("storage.format, storage.models_dir and storage.feature_store must not be empty");
        }
        if self.registry.experiment.is_empty() {
            return invalid("registry.experiment must not be empty");
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> PipelineResult<()> {
    Err(PipelineError::InvalidConfig(msg.into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
