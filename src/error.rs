//! # Module: error
//!
//! Crate-level error taxonomy.  Every stage returns [`PipelineResult`]; the
//! variants map one-to-one onto the failure classes the cycle distinguishes:
//!
//! | Variant | Severity |
//! |---|---|
//! | `InsufficientData` | fatal, cycle aborts before training |
//! | `ClusterTrainingFailed` | fatal for one cluster, reported |
//! | `ModelTypeTrainingFailed` | recovered, candidate dropped |
//! | `RegistryUnavailable` / `StoreUnavailable` | propagated from collaborators |
//! | `AmbiguousPromotionTie` | non-fatal, recorded for audit |
//! | `AllClustersFailed` | fatal, no cluster produced a candidate |

use thiserror::Error;

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// ModelFailure
// ---------------------------------------------------------------------------

/// One model type that could not produce a candidate for a cluster.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ModelFailure {
    pub model_type: String,
    pub cluster: usize,
    pub reason: String,
}

impl std::fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}: {}", self.model_type, self.cluster, self.reason)
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// All errors that can arise while partitioning, training, or promoting.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The dataset has fewer rows than the largest cluster count to test.
    #[error("insufficient data: {rows} rows, need at least max_k = {max_k}")]
    InsufficientData { rows: usize, max_k: usize },

    /// Every configured model type failed for this cluster.
    #[error("training failed for every model type of cluster {cluster} ({} failures)", failures.len())]
    ClusterTrainingFailed { cluster: usize, failures: Vec<ModelFailure> },

    /// One model type failed for one cluster; the cluster continues.
    #[error("model type '{model_type}' failed on cluster {cluster}: {reason}")]
    ModelTypeTrainingFailed { model_type: String, cluster: usize, reason: String },

    /// Every cluster of the cycle failed training.
    #[error("training failed for all {clusters} clusters")]
    AllClustersFailed { clusters: usize },

    /// The experiment registry rejected or could not serve a call.
    #[error("experiment registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The artifact store rejected or could not serve a call.
    #[error("artifact store unavailable: {0}")]
    StoreUnavailable(String),

    /// Two or more model types share the best score for a cluster.
    #[error("ambiguous promotion for cluster {cluster}: {model_types:?} tie at {score}")]
    AmbiguousPromotionTie { cluster: usize, model_types: Vec<String>, score: f64 },

    /// A stage change the lifecycle does not allow (e.g. back to `Train`).
    #[error("invalid stage transition for '{name}' v{version}: {from} -> {to}")]
    InvalidTransition { name: String, version: u64, from: String, to: String },

    /// No version of a registered model is in `Production`.
    #[error("no production version of model '{0}'")]
    NoProductionModel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// `true` for errors that end the whole cycle rather than one cluster.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InsufficientData { .. }
                | PipelineError::AllClustersFailed { .. }
                | PipelineError::InvalidConfig(_)
                | PipelineError::InvalidDataset(_)
        )
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::RegistryUnavailable(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_display_names_both_counts() {
        let e = PipelineError::InsufficientData { rows: 3, max_k: 5 };
        let s = e.to_string();
        assert!(s.contains('3'));
        assert!(s.contains("max_k = 5"));
    }

    #[test]
    fn cluster_training_failed_counts_failures() {
        let e = PipelineError::ClusterTrainingFailed {
            cluster: 2,
            failures: vec![
                ModelFailure { model_type: "A".into(), cluster: 2, reason: "x".into() },
                ModelFailure { model_type: "B".into(), cluster: 2, reason: "y".into() },
            ],
        };
        assert!(e.to_string().contains("cluster 2"));
        assert!(e.to_string().contains("2 failures"));
    }

    #[test]
    fn model_failure_display_uses_suffixed_name() {
        let f = ModelFailure { model_type: "KNearest".into(), cluster: 1, reason: "boom".into() };
        assert_eq!(f.to_string(), "KNearest1: boom");
    }

    #[test]
    fn fatal_classification() {
        assert!(PipelineError::InsufficientData { rows: 1, max_k: 2 }.is_cycle_fatal());
        assert!(PipelineError::AllClustersFailed { clusters: 3 }.is_cycle_fatal());
        assert!(!PipelineError::StoreUnavailable("down".into()).is_cycle_fatal());
        assert!(!PipelineError::ClusterTrainingFailed { cluster: 0, failures: vec![] }
            .is_cycle_fatal());
    }

    #[test]
    fn pipeline_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(PipelineError::RegistryUnavailable("x".into()));
        assert!(e.to_string().contains("registry"));
    }
}
