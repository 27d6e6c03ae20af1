//! # Stage: Cluster Partitioner
//!
//! ## Responsibility
//! Discover the cluster count of one training cycle and assign every row of
//! the dataset to exactly one cluster.  The clustering objective is fitted
//! for `k = 1..=max_k`; the within-cluster sum of squares (WCSS) curve is
//! reduced to a single `k*` by [`select_elbow`].
//!
//! ## Guarantees
//! - Complete: every row receives a label in `0..k*`
//! - Deterministic: given the same rows and a seeded [`Clusterer`], the
//!   same `k*` and the same assignment are produced
//! - Auditable: the WCSS curve and the chosen `k*` are written to the
//!   artifact store before the partition is returned
//! - `k*` is chosen once per cycle and never recomputed mid-cycle
//!
//! ## NOT Responsible For
//! - Registering the clustering model (see `pipeline`)
//! - Training per-cluster models (see `trainer`)

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClusteringConfig;
use crate::dataset::Dataset;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{Clusterer, FittedClustering};
use crate::store::ArtifactStore;

// ---------------------------------------------------------------------------
// Elbow selection
// ---------------------------------------------------------------------------

/// How `k*` was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElbowMethod {
    /// Unique point of maximum distance below the chord of the WCSS curve.
    Knee,
    /// No unambiguous knee; last `k` whose relative improvement cleared
    /// `min_improvement`.
    Threshold,
}

/// The audit record persisted for every partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElbowSelection {
    /// `wcss[i]` is the WCSS of the fit with `k = i + 1`.
    pub wcss: Vec<f64>,
    pub chosen_k: usize,
    pub method: ElbowMethod,
}

/// Scores within this distance of the best knee distance count as a tie.
const KNEE_EPSILON: f64 = 1e-9;

/// Choose `k*` from a WCSS curve (`wcss[i]` belongs to `k = i + 1`).
///
/// The curve is normalised against the chord from its first to its last
/// point; the knee is the interior `k` lying furthest below that chord.  When
/// no interior point lies below the chord, or the furthest distance is shared
/// by two points, the threshold rule applies instead: starting at `k = 1`,
/// step to `k + 1` while `(wcss[k] - wcss[k+1]) / wcss[k] >= min_improvement`.
pub fn select_elbow(wcss: &[f64], min_improvement: f64) -> ElbowSelection {
    let (method, chosen_k) = match knee(wcss) {
        Some(k) => (ElbowMethod::Knee, k),
        None => (ElbowMethod::Threshold, threshold_k(wcss, min_improvement)),
    };
    ElbowSelection { wcss: wcss.to_vec(), chosen_k, method }
}

fn knee(wcss: &[f64]) -> Option<usize> {
    let n = wcss.len();
    if n < 3 {
        return None;
    }
    let first = wcss[0];
    let last = wcss[n - 1];
    let span = first - last;
    if span <= 0.0 {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    let mut tied = false;
    for (i, &w) in wcss.iter().enumerate().take(n - 1).skip(1) {
        let chord = first - span * i as f64 / (n - 1) as f64;
        let distance = (chord - w) / span;
        if distance <= KNEE_EPSILON {
            continue;
        }
        match best {
            Some((_, d)) if (distance - d).abs() <= KNEE_EPSILON => tied = true,
            Some((_, d)) if distance < d => {}
            _ => {
                best = Some((i, distance));
                tied = false;
            }
        }
    }
    if tied {
        return None;
    }
    best.map(|(i, _)| i + 1)
}

fn threshold_k(wcss: &[f64], min_improvement: f64) -> usize {
    let mut k = 1;
    for pair in wcss.windows(2) {
        if pair[0] <= 0.0 || (pair[0] - pair[1]) / pair[0] < min_improvement {
            break;
        }
        k += 1;
    }
    k
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// The outcome of partitioning one dataset.
pub struct Partition {
    pub cluster_count: usize,
    /// Cluster label of each dataset row, row-aligned.
    pub assignment: Vec<usize>,
    /// Clustering model fitted with `k = cluster_count`.
    pub model: Box<dyn FittedClustering>,
    pub elbow: ElbowSelection,
}

impl Partition {
    /// Row indices of each cluster, in ascending row order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.cluster_count];
        for (row, &cluster) in self.assignment.iter().enumerate() {
            if let Some(m) = members.get_mut(cluster) {
                m.push(row);
            }
        }
        members
    }

    /// One row-aligned sub-dataset per cluster, indexed by cluster.
    pub fn split(&self, dataset: &Dataset) -> Vec<Dataset> {
        self.members().iter().map(|rows| dataset.subset(rows)).collect()
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("cluster_count", &self.cluster_count)
            .field("rows", &self.assignment.len())
            .field("elbow", &self.elbow)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ClusterPartitioner
// ---------------------------------------------------------------------------

/// Fits the clustering objective across candidate cluster counts and keeps
/// the one chosen by the elbow rule.
pub struct ClusterPartitioner<'a> {
    config: &'a ClusteringConfig,
    clusterer: &'a dyn Clusterer,
    store: &'a dyn ArtifactStore,
    elbow_key: &'a str,
}

impl<'a> ClusterPartitioner<'a> {
    pub fn new(
        config: &'a ClusteringConfig,
        clusterer: &'a dyn Clusterer,
        store: &'a dyn ArtifactStore,
        elbow_key: &'a str,
    ) -> Self {
        Self { config, clusterer, store, elbow_key }
    }

    /// Partition `dataset` into `k*` clusters.
    ///
    /// # Errors
    /// - `InsufficientData` when the dataset has fewer rows than `max_k`
    /// - `Model` when the clusterer rejects a fit
    /// - `StoreUnavailable` when the elbow artifact cannot be written
    pub fn partition(&self, dataset: &Dataset) -> PipelineResult<Partition> {
        let max_k = self.config.max_k;
        if dataset.is_empty() || dataset.len() < max_k {
            return Err(PipelineError::InsufficientData { rows: dataset.len(), max_k });
        }

        let mut fits: Vec<Box<dyn FittedClustering>> = Vec::with_capacity(max_k);
        for k in 1..=max_k {
            let fitted = self.clusterer.fit(k, dataset.features())?;
            debug!(target: "pipeline::partition", k, wcss = fitted.wcss(), "clustering fitted");
            fits.push(fitted);
        }

        let wcss: Vec<f64> = fits.iter().map(|f| f.wcss()).collect();
        let elbow = select_elbow(&wcss, self.config.min_improvement);
        self.store.put(self.elbow_key, &serde_json::to_vec_pretty(&elbow)?)?;

        let cluster_count = elbow.chosen_k;
        let model = fits.swap_remove(cluster_count - 1);
        let assignment: Vec<usize> = dataset.features().iter().map(|row| model.assign(row)).collect();

        let partition = Partition { cluster_count, assignment, model, elbow };
        for (cluster, rows) in partition.members().iter().enumerate() {
            if rows.is_empty() {
                warn!(target: "pipeline::partition", cluster, "cluster received no rows");
            }
        }
        info!(
            target: "pipeline::partition",
            rows = dataset.len(),
            cluster_count,
            method = ?partition.elbow.method,
            "dataset partitioned"
        );
        Ok(partition)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
