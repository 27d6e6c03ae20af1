//! # Stage: Promotion Selector
//!
//! ## Responsibility
//! Decide, from the complete run history, which model type is the best ever
//! seen for each cluster.  Pure: no registry or store access, so every rule
//! is unit-testable against hand-built runs.
//!
//! ## Guarantees
//! - Best-ever: each metric key contributes the maximum value over all runs;
//!   runs that do not report a key contribute nothing
//! - Structured lookup: metric keys are built from [`ModelKey`] values, never
//!   matched by substring, so cluster `1` cannot pick up `X10-best_score`
//! - Deterministic ties: exact ties resolve by metric-key order
//!   ([`TieBreak`]) and are recorded in [`PromotionDecision::ties`]
//! - Idempotent: identical history yields an identical decision
//! - Monotone: a new run scoring below a key's current maximum cannot change
//!   the decision
//!
//! ## NOT Responsible For
//! - Changing stages (see `transition`)
//! - Fetching the history (see `pipeline`)

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TieBreak;
use crate::error::PipelineError;
use crate::keys::ModelKey;
use crate::registry::Run;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Winning model type of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterWinner {
    pub cluster: usize,
    pub model_type: String,
    pub score: f64,
}

impl ClusterWinner {
    pub fn key(&self) -> ModelKey {
        ModelKey::for_cluster(self.model_type.as_str(), self.cluster)
    }
}

/// Model types sharing the best score of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionTie {
    pub cluster: usize,
    /// Tied model types, ascending.
    pub model_types: Vec<String>,
    pub score: f64,
    /// The model type the tie-break picked.
    pub resolved_to: String,
}

impl PromotionTie {
    /// The tie as the non-fatal error it is audited as.
    pub fn to_error(&self) -> PipelineError {
        PipelineError::AmbiguousPromotionTie {
            cluster: self.cluster,
            model_types: self.model_types.clone(),
            score: self.score,
        }
    }
}

/// Per-cluster winners of one promotion cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PromotionDecision {
    /// Registered name of the clustering model; always promoted.
    pub clustering_model: String,
    pub winners: BTreeMap<usize, ClusterWinner>,
    pub ties: Vec<PromotionTie>,
    /// Clusters in `0..cluster_count` with no score in the history.
    pub unscored: Vec<usize>,
}

impl PromotionDecision {
    /// Winning model type of `cluster`, if any.
    pub fn winner(&self, cluster: usize) -> Option<&str> {
        self.winners.get(&cluster).map(|w| w.model_type.as_str())
    }

    /// Whether the registered model `name` should be in `Production`.
    pub fn is_promoted(&self, name: &str) -> bool {
        if name == self.clustering_model {
            return true;
        }
        match ModelKey::parse_registered(name) {
            Some(ModelKey { model_type, cluster: Some(cluster) }) => {
                self.winner(cluster) == Some(model_type.as_str())
            }
            _ => false,
        }
    }

    /// Drop the winners of `clusters`; their models stay in `Staging`.
    pub fn exclude(&mut self, clusters: &[usize]) {
        for cluster in clusters {
            self.winners.remove(cluster);
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Best value ever logged per metric key.  NaN values are ignored.
pub fn best_scores(runs: &[Run]) -> BTreeMap<String, f64> {
    let mut best: BTreeMap<String, f64> = BTreeMap::new();
    for run in runs {
        for (key, &value) in &run.metrics {
            if value.is_nan() {
                continue;
            }
            best.entry(key.clone())
                .and_modify(|b| {
                    if value > *b {
                        *b = value;
                    }
                })
                .or_insert(value);
        }
    }
    best
}

/// Model types competing for clusters: every registered name except the
/// clustering model, reduced to its model-type part.
pub fn competing_model_types(registered_names: &[String], clustering_name: &str) -> BTreeSet<String> {
    registered_names
        .iter()
        .filter(|name| name.as_str() != clustering_name)
        .filter_map(|name| ModelKey::parse_registered(name))
        .map(|key| key.model_type)
        .filter(|model_type| model_type != clustering_name)
        .collect()
}

// ---------------------------------------------------------------------------
// select_promotions
// ---------------------------------------------------------------------------

/// Pick the best model type for every cluster in `0..cluster_count`.
pub fn select_promotions(
    all_runs: &[Run],
    registered_names: &[String],
    cluster_count: usize,
    clustering_name: &str,
    tie_break: TieBreak,
) -> PromotionDecision {
    let best = best_scores(all_runs);
    let model_types = competing_model_types(registered_names, clustering_name);
    let mut decision = PromotionDecision {
        clustering_model: clustering_name.to_string(),
        ..PromotionDecision::default()
    };

    for cluster in 0..cluster_count {
        // (metric key, model type, score) of every type with evidence.
        let scored: Vec<(String, &str, f64)> = model_types
            .iter()
            .filter_map(|model_type| {
                let metric = ModelKey::for_cluster(model_type.as_str(), cluster).metric_key();
                best.get(&metric).map(|&score| (metric, model_type.as_str(), score))
            })
            .collect();

        let Some(top) = scored.iter().map(|s| s.2).reduce(f64::max) else {
            debug!(target: "pipeline::promotion", cluster, "no scores for cluster");
            decision.unscored.push(cluster);
            continue;
        };
        let tied: Vec<&(String, &str, f64)> = scored.iter().filter(|s| s.2 == top).collect();
        let chosen = match tie_break {
            TieBreak::LowestKey => tied.iter().min_by(|a, b| a.0.cmp(&b.0)),
            TieBreak::HighestKey => tied.iter().max_by(|a, b| a.0.cmp(&b.0)),
        };
        let Some(&&(_, model_type, score)) = chosen else {
            continue;
        };

        if tied.len() > 1 {
            let mut tied_types: Vec<String> = tied.iter().map(|t| t.1.to_string()).collect();
            tied_types.sort();
            let tie = PromotionTie {
                cluster,
                model_types: tied_types,
                score,
                resolved_to: model_type.to_string(),
            };
            warn!(
                target: "pipeline::promotion",
                error = %tie.to_error(),
                resolved_to = model_type,
                "promotion tie resolved by metric-key order"
            );
            decision.ties.push(tie);
        }
        decision
            .winners
            .insert(cluster, ClusterWinner { cluster, model_type: model_type.to_string(), score });
    }

    info!(
        target: "pipeline::promotion",
        clusters = cluster_count,
        winners = decision.winners.len(),
        ties = decision.ties.len(),
        "promotion decision computed"
    );
    decision
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
