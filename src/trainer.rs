//! # Stage: Per-Cluster Trainer
//!
//! ## Responsibility
//! Train every configured model type on one cluster, score each on a held-out
//! test subset, and record the winners of each search as candidate models:
//! one artifact, one run and one registered version per candidate.
//!
//! ## Guarantees
//! - Reproducible split: identical rows and seed give identical train/test
//!   subsets ([`train_test_split`])
//! - Partial-failure tolerant: a failing model type is logged at `warn` and
//!   dropped; the cluster fails only when every model type fails
//! - Key-scoped writes: every artifact and registered name is derived from
//!   its own `(model-type, cluster)` key, so clusters can train concurrently
//! - Stateless: the trainer holds only shared references; each call returns
//!   fresh, immutable [`CandidateModel`] values
//!
//! ## NOT Responsible For
//! - Choosing hyperparameters (see `search`)
//! - Deciding which candidate is promoted (see `promotion`)

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{StorageConfig, TrainingConfig};
use crate::dataset::Dataset;
use crate::error::{ModelFailure, PipelineError, PipelineResult};
use crate::keys::ModelKey;
use crate::model::{accuracy, CatalogEntry, ModelCatalog, ParamSet};
use crate::registry::{ExperimentRegistry, Metrics, Params};
use crate::search::SearchStrategy;
use crate::store::ArtifactStore;

/// Rows needed before a cluster can be split into train and test subsets.
pub const MIN_CLUSTER_ROWS: usize = 2;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One trained (model-type, cluster) candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateModel {
    pub key: ModelKey,
    /// Winning hyperparameters of the search.
    pub params: ParamSet,
    /// Mean cross-validated score of `params` on the train subset.
    pub validation_score: f64,
    /// Accuracy on the held-out test subset; the promotion evidence.
    pub score: f64,
    pub artifact_key: String,
    pub run_id: String,
    /// Registered version of `key.registered_name()`.
    pub version: u64,
}

/// Everything one successful `train_cluster` call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterOutcome {
    pub cluster: usize,
    pub candidates: Vec<CandidateModel>,
    /// Model types dropped for this cluster.
    pub failures: Vec<ModelFailure>,
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Seeded shuffle of `0..rows` into (train, test) index lists.
///
/// The test size is `ceil(rows * test_fraction)`, kept within
/// `1..rows` whenever `rows >= 2` so neither side is empty.
pub fn train_test_split(rows: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test_len = if rows < MIN_CLUSTER_ROWS {
        0
    } else {
        ((rows as f64 * test_fraction).ceil() as usize).clamp(1, rows - 1)
    };
    let train = indices.split_off(test_len);
    (train, indices)
}

// ---------------------------------------------------------------------------
// ClusterTrainer
// ---------------------------------------------------------------------------

/// Trains the model catalog on one cluster at a time.
///
/// Holds only shared references, so one trainer can serve every worker of a
/// parallel fan-out.
pub struct ClusterTrainer<'a> {
    pub catalog: &'a ModelCatalog,
    pub search: &'a dyn SearchStrategy,
    pub store: &'a dyn ArtifactStore,
    pub registry: &'a dyn ExperimentRegistry,
    pub training: &'a TrainingConfig,
    pub storage: &'a StorageConfig,
    pub experiment: &'a str,
    /// Run-name prefix; the cluster index is appended.
    pub run_name: &'a str,
}

impl<'a> ClusterTrainer<'a> {
    /// Train every catalog entry on `data`, the rows of cluster `cluster`.
    ///
    /// # Errors
    /// `ClusterTrainingFailed` when no model type produced a candidate, with
    /// one [`ModelFailure`] per model type.
    pub fn train_cluster(&self, cluster: usize, data: &Dataset) -> PipelineResult<ClusterOutcome> {
        if data.len() < MIN_CLUSTER_ROWS {
            let reason = format!("cluster has {} rows, need at least {}", data.len(), MIN_CLUSTER_ROWS);
            let failures = self
                .catalog
                .entries()
                .iter()
                .map(|e| ModelFailure { model_type: e.name.clone(), cluster, reason: reason.clone() })
                .collect();
            error!(target: "pipeline::trainer", cluster, rows = data.len(), "cluster too small to train");
            return Err(PipelineError::ClusterTrainingFailed { cluster, failures });
        }

        let (train_idx, test_idx) =
            train_test_split(data.len(), self.training.test_fraction, self.training.seed);
        let train = data.subset(&train_idx);
        let test = data.subset(&test_idx);
        info!(
            target: "pipeline::trainer",
            cluster,
            train_rows = train.len(),
            test_rows = test.len(),
            "training cluster"
        );

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for entry in self.catalog.entries() {
            match self.train_one(entry, cluster, &train, &test) {
                Ok(candidate) => {
                    info!(
                        target: "pipeline::trainer",
                        cluster,
                        model_type = %entry.name,
                        score = candidate.score,
                        version = candidate.version,
                        "candidate recorded"
                    );
                    candidates.push(candidate);
                }
                Err(e) => {
                    warn!(target: "pipeline::trainer", cluster, model_type = %entry.name, error = %e, "model type dropped");
                    failures.push(ModelFailure {
                        model_type: entry.name.clone(),
                        cluster,
                        reason: failure_reason(e),
                    });
                }
            }
        }

        if candidates.is_empty() {
            error!(target: "pipeline::trainer", cluster, failures = failures.len(), "every model type failed");
            return Err(PipelineError::ClusterTrainingFailed { cluster, failures });
        }
        Ok(ClusterOutcome { cluster, candidates, failures })
    }

    fn train_one(
        &self,
        entry: &CatalogEntry,
        cluster: usize,
        train: &Dataset,
        test: &Dataset,
    ) -> PipelineResult<CandidateModel> {
        let model_failed = |reason: String| PipelineError::ModelTypeTrainingFailed {
            model_type: entry.name.clone(),
            cluster,
            reason,
        };

        let outcome = self
            .search
            .search(entry.model.as_ref(), &entry.grid, train)
            .map_err(|e| model_failed(e.to_string()))?;
        let fitted = entry
            .model
            .fit(&outcome.params, train)
            .map_err(|e| model_failed(e.to_string()))?;
        let score = accuracy(fitted.as_ref(), test);
        let bytes = fitted.to_bytes().map_err(|e| model_failed(e.to_string()))?;

        let key = ModelKey::for_cluster(entry.name.as_str(), cluster);
        let artifact_key = key.artifact_key(&self.storage.models_dir, &self.storage.format);
        self.store.put(&artifact_key, &bytes)?;

        let mut metrics = Metrics::new();
        metrics.insert(key.metric_key(), score);
        let mut params: Params = outcome.params.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        params.insert("model_kind".into(), serde_json::Value::from(entry.model.kind()));
        params.insert("cluster".into(), serde_json::Value::from(cluster));

        let run_name = format!("{}{}", self.run_name, cluster);
        let run_id = self.registry.log_run(self.experiment, &run_name, &metrics, &params)?;
        let version = self
            .registry
            .register_model_version(&key.registered_name(), Some(run_id.as_str()), &artifact_key)?;

        Ok(CandidateModel {
            key,
            params: outcome.params,
            validation_score: outcome.validation_score,
            score,
            artifact_key,
            run_id,
            version: version.version,
        })
    }
}

/// Reason text of a dropped model type, without repeating its identity.
fn failure_reason(e: PipelineError) -> String {
    match e {
        PipelineError::ModelTypeTrainingFailed { reason, .. } => reason,
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::{FittedModel, ModelError, ModelType, ParamGrid};
    use crate::registry::{InMemoryRegistry, Stage};
    use crate::search::GridSearch;
    use crate::store::InMemoryArtifactStore;
    use proptest::prelude::*;

    struct Broken;

    impl ModelType for Broken {
        fn kind(&self) -> &str {
            "broken"
        }
        fn fit(&self, _params: &ParamSet, _data: &Dataset) -> Result<Box<dyn FittedModel>, ModelError> {
            Err(ModelError::Other("solver diverged".into()))
        }
        fn load(&self, _bytes: &[u8]) -> Result<Box<dyn FittedModel>, ModelError> {
            Err(ModelError::Other("solver diverged".into()))
        }
    }

    struct Fixture {
        config: PipelineConfig,
        catalog: ModelCatalog,
        search: GridSearch,
        store: InMemoryArtifactStore,
        registry: InMemoryRegistry,
    }

    impl Fixture {
        fn new(catalog: ModelCatalog) -> Self {
            Self {
                config: PipelineConfig::default(),
                catalog,
                search: GridSearch::default(),
                store: InMemoryArtifactStore::new(),
                registry: InMemoryRegistry::new(),
            }
        }

        fn trainer(&self) -> ClusterTrainer<'_> {
            ClusterTrainer {
                catalog: &self.catalog,
                search: &self.search,
                store: &self.store,
                registry: &self.registry,
                training: &self.config.training,
                storage: &self.config.storage,
                experiment: "exp",
                run_name: "train",
            }
        }
    }

    fn cluster_data() -> Dataset {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..24 {
            let class = (i % 2) as i64;
            rows.push(vec![class as f64 * 8.0 + (i as f64) * 0.05, 1.0]);
            labels.push(class);
        }
        Dataset::new(rows, labels).unwrap()
    }

    // -- split ---------------------------------------------------------------

    #[test]
    fn split_sizes_follow_fraction() {
        let (train, test) = train_test_split(30, 0.33, 355);
        assert_eq!(test.len(), 10);
        assert_eq!(train.len(), 20);
    }

    #[test]
    fn split_never_empties_either_side() {
        let (train, test) = train_test_split(2, 0.99, 1);
        assert_eq!((train.len(), test.len()), (1, 1));
        let (train, test) = train_test_split(5, 0.01, 1);
        assert_eq!((train.len(), test.len()), (4, 1));
    }

    #[test]
    fn different_seeds_shuffle_differently() {
        assert_ne!(train_test_split(50, 0.3, 1), train_test_split(50, 0.3, 2));
    }

    proptest! {
        #[test]
        fn split_is_deterministic_and_disjoint(rows in 2usize..200, fraction in 0.05f64..0.95, seed: u64) {
            let first = train_test_split(rows, fraction, seed);
            prop_assert_eq!(&first, &train_test_split(rows, fraction, seed));
            let mut all: Vec<usize> = first.0.iter().chain(&first.1).copied().collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..rows).collect::<Vec<_>>());
        }
    }

    // -- train_cluster -------------------------------------------------------

    #[test]
    fn every_model_type_yields_a_recorded_candidate() {
        let fx = Fixture::new(ModelCatalog::from_specs(&PipelineConfig::default().training.models));
        let outcome = fx.trainer().train_cluster(2, &cluster_data()).unwrap();

        assert_eq!(outcome.cluster, 2);
        assert!(outcome.failures.is_empty());
        let names: Vec<String> = outcome.candidates.iter().map(|c| c.key.registered_name()).collect();
        assert_eq!(names, vec!["NearestCentroid2", "KNearest2"]);

        let runs = fx.registry.get_all_runs("exp").unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.run_name == "train2"));
        assert!(runs[0].metrics.contains_key("NearestCentroid2-best_score"));

        for c in &outcome.candidates {
            assert!((0.0..=1.0).contains(&c.score));
            assert_eq!(c.artifact_key, format!("models/{}.json", c.key.registered_name()));
            assert!(fx.store.get(&c.artifact_key).is_ok());
            let v = fx.registry.latest_version(&c.key.registered_name()).unwrap().unwrap();
            assert_eq!(v.stage, Stage::Train);
            assert_eq!(v.run_id.as_deref(), Some(c.run_id.as_str()));
        }
    }

    #[test]
    fn a_failing_model_type_is_dropped_not_fatal() {
        let mut catalog = ModelCatalog::from_specs(&PipelineConfig::default().training.models);
        catalog.register("Broken", Box::new(Broken), ParamGrid::new());
        let fx = Fixture::new(catalog);
        let outcome = fx.trainer().train_cluster(0, &cluster_data()).unwrap();

        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].model_type, "Broken");
        assert!(outcome.failures[0].reason.contains("solver diverged"));
        assert!(fx.registry.latest_version("Broken0").unwrap().is_none());
    }

    #[test]
    fn all_model_types_failing_fails_the_cluster() {
        let mut catalog = ModelCatalog::new();
        catalog.register("Broken", Box::new(Broken), ParamGrid::new());
        let fx = Fixture::new(catalog);
        match fx.trainer().train_cluster(4, &cluster_data()) {
            Err(PipelineError::ClusterTrainingFailed { cluster, failures }) => {
                assert_eq!(cluster, 4);
                assert_eq!(failures.len(), 1);
            }
            other => panic!("expected ClusterTrainingFailed, got {:?}", other),
        }
        assert!(fx.registry.get_all_runs("exp").unwrap().is_empty());
    }

    #[test]
    fn single_row_cluster_fails_every_model_type() {
        let fx = Fixture::new(ModelCatalog::from_specs(&PipelineConfig::default().training.models));
        let one = Dataset::new(vec![vec![1.0]], vec![0]).unwrap();
        match fx.trainer().train_cluster(1, &one) {
            Err(PipelineError::ClusterTrainingFailed { failures, .. }) => assert_eq!(failures.len(), 2),
            other => panic!("expected ClusterTrainingFailed, got {:?}", other),
        }
    }

    #[test]
    fn retraining_registers_a_new_version() {
        let fx = Fixture::new(ModelCatalog::from_specs(&PipelineConfig::default().training.models));
        let first = fx.trainer().train_cluster(0, &cluster_data()).unwrap();
        let second = fx.trainer().train_cluster(0, &cluster_data()).unwrap();
        assert_eq!(first.candidates[0].version, 1);
        assert_eq!(second.candidates[0].version, 2);
        // Same split and seeded models give the same score.
        assert_eq!(first.candidates[0].score, second.candidates[0].score);
    }
}
