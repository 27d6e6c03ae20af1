//! # Stage: Promotion Pipeline
//!
//! ## Responsibility
//! The entry point an external scheduler calls.  Runs one promotion cycle
//! end to end, strictly ordered:
//!
//! ```text
//! read table → partition → register clustering model → export clusters
//!            → train every cluster (optionally in parallel) ── barrier ──
//!            → select promotions → apply transitions → PromotionReport
//! ```
//!
//! `run_promotion_cycle` runs only the last two steps against the existing
//! run history.
//!
//! ## Guarantees
//! - Raises only before training starts (unreadable or too-small dataset) or
//!   when every cluster failed (`AllClustersFailed`); every later failure is
//!   accumulated in the [`PromotionReport`]
//! - Barrier: selection starts only after every cluster's training returned
//! - Clusters that failed this cycle are excluded from promotion
//! - Nothing becomes externally visible before the transition step, so a
//!   cycle cancelled earlier can be re-run freely
//!
//! ## NOT Responsible For
//! - Scheduling, retries, or timeouts
//! - Model algorithms (see `model`)

use std::sync::Arc;

use colored::*;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::error::{ModelFailure, PipelineError, PipelineResult};
use crate::keys::{cluster_table_key, cluster_table_prefix, ModelKey};
use crate::model::kmeans::KMeans;
use crate::model::{Clusterer, ModelCatalog};
use crate::partition::{ClusterPartitioner, ElbowSelection, Partition};
use crate::prediction::{PredictionBatch, Predictor};
use crate::promotion::{select_promotions, PromotionDecision, PromotionTie};
use crate::registry::{ExperimentRegistry, Metrics, Params};
use crate::search::{GridSearch, SearchStrategy};
use crate::store::{ArtifactStore, DataSource, StoreTableSource};
use crate::trainer::{ClusterOutcome, ClusterTrainer};
use crate::transition::{self, TransitionRecord};

/// Metric suffix of the clustering model's run.
pub const WCSS_SUFFIX: &str = "-wcss";

// ---------------------------------------------------------------------------
// PromotionReport
// ---------------------------------------------------------------------------

/// Which steps a cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    TrainAndPromote,
    PromoteOnly,
}

/// Score of one candidate trained this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub model_type: String,
    pub score: f64,
    pub version: u64,
}

/// Outcome of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub cluster: usize,
    /// Promoted model type and its best-ever score.
    pub winner: Option<String>,
    pub score: Option<f64>,
    /// Candidates trained this cycle (empty for promote-only cycles).
    pub candidates: Vec<CandidateSummary>,
    /// Model types dropped this cycle.
    pub failures: Vec<ModelFailure>,
    /// Every model type failed; the cluster was excluded from promotion.
    pub training_failed: bool,
}

/// Structured result of one cycle, returned even on partial failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionReport {
    pub cycle_id: String,
    pub mode: CycleMode,
    pub cluster_count: usize,
    /// Elbow curve of this cycle's partition (train cycles only).
    pub elbow: Option<ElbowSelection>,
    pub clusters: Vec<ClusterReport>,
    /// Exact score ties resolved by the tie-break rule.
    pub ties: Vec<PromotionTie>,
    pub transitions: Vec<TransitionRecord>,
    /// Collaborator failures that did not abort the cycle.
    pub errors: Vec<String>,
}

impl PromotionReport {
    fn new(mode: CycleMode, cluster_count: usize) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            mode,
            cluster_count,
            elbow: None,
            clusters: (0..cluster_count)
                .map(|cluster| ClusterReport {
                    cluster,
                    winner: None,
                    score: None,
                    candidates: Vec::new(),
                    failures: Vec::new(),
                    training_failed: false,
                })
                .collect(),
            ties: Vec::new(),
            transitions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn cluster(&self, cluster: usize) -> Option<&ClusterReport> {
        self.clusters.get(cluster)
    }

    /// Promoted model type of `cluster`.
    pub fn winner(&self, cluster: usize) -> Option<&str> {
        self.cluster(cluster).and_then(|c| c.winner.as_deref())
    }

    /// Clusters whose every model type failed this cycle.
    pub fn failed_clusters(&self) -> Vec<usize> {
        self.clusters.iter().filter(|c| c.training_failed).map(|c| c.cluster).collect()
    }

    /// `true` when every cluster has a winner and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self.clusters.iter().all(|c| c.winner.is_some() && c.failures.is_empty())
            && self.transitions.iter().all(TransitionRecord::succeeded)
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable coloured summary for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mode = match self.mode {
            CycleMode::TrainAndPromote => "train + promote",
            CycleMode::PromoteOnly => "promote only",
        };
        out.push_str(&format!(
            "{} {} ({}, {} clusters)\n",
            "PROMOTION CYCLE".bright_cyan().bold(),
            self.cycle_id.dimmed(),
            mode,
            self.cluster_count
        ));
        for c in &self.clusters {
            let status = match (&c.winner, c.training_failed) {
                (_, true) => "FAILED".red().bold().to_string(),
                (Some(w), false) => format!("{} {:.4}", w.green().bold(), c.score.unwrap_or(f64::NAN)),
                (None, false) => "no winner".yellow().to_string(),
            };
            out.push_str(&format!("  cluster {:>3}  {}\n", c.cluster, status));
            for cand in &c.candidates {
                out.push_str(&format!(
                    "      {:<20} {:.4}  v{}\n",
                    cand.model_type, cand.score, cand.version
                ));
            }
            for f in &c.failures {
                out.push_str(&format!("      {:<20} {}\n", f.model_type.red(), f.reason));
            }
        }
        for t in &self.ties {
            out.push_str(&format!("  {} {} -> {}\n", "tie".yellow(), t.to_error(), t.resolved_to));
        }
        for t in &self.transitions {
            let line = format!("{} v{}: {} -> {}", t.name, t.version, t.from, t.to);
            if t.succeeded() {
                out.push_str(&format!("  {}\n", line));
            } else {
                out.push_str(&format!("  {} {}\n", line.red(), "(failed)".red()));
            }
        }
        for e in &self.errors {
            out.push_str(&format!("  {} {}\n", "error".red().bold(), e));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// PromotionPipeline
// ---------------------------------------------------------------------------

/// Owns the collaborators of one deployment and runs cycles against them.
pub struct PromotionPipeline {
    config: PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    data: Arc<dyn DataSource>,
    registry: Arc<dyn ExperimentRegistry>,
    catalog: ModelCatalog,
    clusterer: Box<dyn Clusterer>,
    search: Box<dyn SearchStrategy>,
}

impl PromotionPipeline {
    /// Build a pipeline with the built-in model catalog, k-means and grid
    /// search; tables are read from `store`.
    ///
    /// # Errors
    /// `InvalidConfig` when the configuration fails validation.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ArtifactStore>,
        registry: Arc<dyn ExperimentRegistry>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            data: Arc::new(StoreTableSource::new(store.clone())),
            catalog: ModelCatalog::from_specs(&config.training.models),
            clusterer: Box::new(KMeans { max_iter: config.clustering.max_iter, seed: config.clustering.seed }),
            search: Box::new(GridSearch { folds: config.training.cv_folds }),
            config,
            store,
            registry,
        })
    }

    pub fn with_data_source(mut self, data: Arc<dyn DataSource>) -> Self {
        self.data = data;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_clusterer(mut self, clusterer: Box<dyn Clusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    pub fn with_search(mut self, search: Box<dyn SearchStrategy>) -> Self {
        self.search = search;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Write `dataset` to the configured training table, replacing it.
    pub fn import_training_table(&self, dataset: &Dataset) -> PipelineResult<()> {
        self.data.write_table(dataset, &self.config.storage.training_table)?;
        info!(
            target: "pipeline::cycle",
            rows = dataset.len(),
            key = %self.config.storage.training_table,
            "training table imported"
        );
        Ok(())
    }

    /// Read the configured training table and run a full cycle on it.
    pub fn run_training_and_promotion_cycle(&self) -> PipelineResult<PromotionReport> {
        let dataset = self.data.read_table(&self.config.storage.training_table)?;
        self.run_cycle_on(&dataset)
    }

    /// Run a full cycle on an already-loaded dataset.
    ///
    /// # Errors
    /// - `InsufficientData` when the dataset has fewer rows than `max_k`
    /// - `Model` / `StoreUnavailable` when partitioning itself fails
    /// - `AllClustersFailed` when no cluster produced a candidate
    pub fn run_cycle_on(&self, dataset: &Dataset) -> PipelineResult<PromotionReport> {
        info!(target: "pipeline::cycle", rows = dataset.len(), "training cycle started");

        let partition = ClusterPartitioner::new(
            &self.config.clustering,
            self.clusterer.as_ref(),
            self.store.as_ref(),
            &self.config.storage.elbow_artifact,
        )
        .partition(dataset)
        .map_err(|e| {
            error!(target: "pipeline::cycle", error = %e, "partitioning failed");
            e
        })?;

        let mut report = PromotionReport::new(CycleMode::TrainAndPromote, partition.cluster_count);
        report.elbow = Some(partition.elbow.clone());

        if let Err(e) = self.register_clustering_model(&partition) {
            warn!(target: "pipeline::cycle", error = %e, "clustering model not registered");
            report.errors.push(format!("clustering model: {}", e));
        }

        let clusters = partition.split(dataset);
        for (i, table) in clusters.iter().enumerate() {
            let key = cluster_table_key(&self.config.storage.feature_store, i);
            if let Err(e) = self.data.write_table(table, &key) {
                warn!(target: "pipeline::cycle", cluster = i, error = %e, "cluster table not exported");
                report.errors.push(format!("cluster {} export: {}", i, e));
            }
        }

        // Barrier: collect() returns only after every cluster finished.
        let results = self.train_all(&clusters);
        for result in results {
            match result {
                Ok(outcome) => {
                    let entry = &mut report.clusters[outcome.cluster];
                    entry.candidates = outcome
                        .candidates
                        .iter()
                        .map(|c| CandidateSummary {
                            model_type: c.key.model_type.clone(),
                            score: c.score,
                            version: c.version,
                        })
                        .collect();
                    entry.failures = outcome.failures;
                }
                Err(PipelineError::ClusterTrainingFailed { cluster, failures }) => {
                    if let Some(entry) = report.clusters.get_mut(cluster) {
                        entry.training_failed = true;
                        entry.failures = failures;
                    }
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let failed = report.failed_clusters();
        if failed.len() == partition.cluster_count {
            error!(target: "pipeline::cycle", clusters = failed.len(), "every cluster failed training");
            return Err(PipelineError::AllClustersFailed { clusters: failed.len() });
        }

        self.promote(&mut report, &failed);
        info!(
            target: "pipeline::cycle",
            cycle_id = %report.cycle_id,
            clusters = report.cluster_count,
            failed = failed.len(),
            "training cycle finished"
        );
        Ok(report)
    }

    /// Re-run selection and transitions against the existing run history,
    /// without training.
    ///
    /// The cluster count comes from the last elbow artifact, or failing that
    /// from the exported cluster tables.
    pub fn run_promotion_cycle(&self) -> PipelineResult<PromotionReport> {
        let cluster_count = self.stored_cluster_count()?;
        info!(target: "pipeline::cycle", cluster_count, "promotion cycle started");
        let mut report = PromotionReport::new(CycleMode::PromoteOnly, cluster_count);
        self.promote(&mut report, &[]);
        Ok(report)
    }

    /// Load the models the last promotion put in `Production`.
    pub fn load_predictor(&self) -> PipelineResult<Predictor> {
        Predictor::load(
            &self.config.clustering.model_name,
            self.clusterer.as_ref(),
            &self.catalog,
            self.store.as_ref(),
            self.registry.as_ref(),
        )
    }

    /// Store `batch` as pretty JSON under `key` in the artifact store.
    pub fn write_predictions(&self, batch: &PredictionBatch, key: &str) -> PipelineResult<()> {
        self.store.put(key, &serde_json::to_vec_pretty(batch)?)?;
        info!(target: "pipeline::predict", rows = batch.predictions.len(), key = %key, "predictions written");
        Ok(())
    }

    // -- steps ---------------------------------------------------------------

    fn train_all(&self, clusters: &[Dataset]) -> Vec<PipelineResult<ClusterOutcome>> {
        let trainer = ClusterTrainer {
            catalog: &self.catalog,
            search: self.search.as_ref(),
            store: self.store.as_ref(),
            registry: self.registry.as_ref(),
            training: &self.config.training,
            storage: &self.config.storage,
            experiment: &self.config.registry.experiment,
            run_name: &self.config.registry.run_name,
        };
        if self.config.training.parallel {
            clusters
                .par_iter()
                .enumerate()
                .map(|(i, data)| trainer.train_cluster(i, data))
                .collect()
        } else {
            clusters.iter().enumerate().map(|(i, data)| trainer.train_cluster(i, data)).collect()
        }
    }

    fn register_clustering_model(&self, partition: &Partition) -> PipelineResult<()> {
        let name = &self.config.clustering.model_name;
        let key = ModelKey::global(name.as_str());
        let artifact_key = key.artifact_key(&self.config.storage.models_dir, &self.config.storage.format);
        self.store.put(&artifact_key, &partition.model.to_bytes()?)?;

        let mut metrics = Metrics::new();
        metrics.insert(format!("{}{}", name, WCSS_SUFFIX), partition.model.wcss());
        let mut params = Params::new();
        params.insert("k".into(), serde_json::Value::from(partition.cluster_count));
        let run_name = format!("{}-clustering", self.config.registry.run_name);
        let run_id = self.registry.log_run(&self.config.registry.experiment, &run_name, &metrics, &params)?;
        let version = self.registry.register_model_version(name, Some(run_id.as_str()), &artifact_key)?;
        info!(
            target: "pipeline::cycle",
            name = %name,
            version = version.version,
            k = partition.cluster_count,
            "clustering model registered"
        );
        Ok(())
    }

    fn stored_cluster_count(&self) -> PipelineResult<usize> {
        if let Ok(bytes) = self.store.get(&self.config.storage.elbow_artifact) {
            if let Ok(elbow) = serde_json::from_slice::<ElbowSelection>(&bytes) {
                return Ok(elbow.chosen_k);
            }
        }
        let prefix = cluster_table_prefix(&self.config.storage.feature_store);
        let count = self
            .store
            .list(&prefix)?
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix).and_then(|i| i.parse::<usize>().ok()))
            .map(|i| i + 1)
            .max()
            .unwrap_or(0);
        Ok(count)
    }

    /// Select and apply; collaborator failures land in `report.errors`.
    fn promote(&self, report: &mut PromotionReport, excluded: &[usize]) {
        match self.decide(report.cluster_count) {
            Ok(mut decision) => {
                decision.exclude(excluded);
                for entry in report.clusters.iter_mut() {
                    if let Some(w) = decision.winners.get(&entry.cluster) {
                        entry.winner = Some(w.model_type.clone());
                        entry.score = Some(w.score);
                    }
                }
                report.ties = decision.ties.clone();
                match self.registry.latest_versions() {
                    Ok(versions) => {
                        report.transitions = transition::apply(&decision, &versions, self.registry.as_ref());
                    }
                    Err(e) => {
                        warn!(target: "pipeline::cycle", error = %e, "could not list model versions");
                        report.errors.push(format!("list versions: {}", e));
                        return;
                    }
                }
                match self.registry.all_versions() {
                    Ok(all) => {
                        report
                            .transitions
                            .extend(transition::retire_superseded(&all, self.registry.as_ref()));
                    }
                    Err(e) => {
                        warn!(target: "pipeline::cycle", error = %e, "superseded versions not retired");
                        report.errors.push(format!("retire superseded: {}", e));
                    }
                }
            }
            Err(e) => {
                warn!(target: "pipeline::cycle", error = %e, "promotion skipped");
                report.errors.push(format!("promotion: {}", e));
            }
        }
    }

    fn decide(&self, cluster_count: usize) -> PipelineResult<PromotionDecision> {
        let runs = self.registry.get_all_runs(&self.config.registry.experiment)?;
        let names = self.registry.registered_names()?;
        Ok(select_promotions(
            &runs,
            &names,
            cluster_count,
            &self.config.clustering.model_name,
            self.config.promotion.tie_break,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
