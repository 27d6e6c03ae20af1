//! # Module: keys
//!
//! Structured identity for everything the cycle names: registered models,
//! metric keys, and artifact keys.  A [`ModelKey`] is a model type plus an
//! optional cluster index; all string forms are derived from it, and parsing
//! only ever splits a trailing run of digits, so cluster `1` can never be
//! confused with cluster `10`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to every score metric key.
pub const BEST_SCORE_SUFFIX: &str = "-best_score";

/// A (model-type, cluster-index) pair.  The global clustering model carries
/// no cluster index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub model_type: String,
    pub cluster: Option<usize>,
}

impl ModelKey {
    /// Key for a per-cluster candidate model.
    pub fn for_cluster(model_type: impl Into<String>, cluster: usize) -> Self {
        Self { model_type: model_type.into(), cluster: Some(cluster) }
    }

    /// Key for a model shared by all clusters (the clustering model).
    pub fn global(model_type: impl Into<String>) -> Self {
        Self { model_type: model_type.into(), cluster: None }
    }

    /// Registered model name: `"<model-type><index?>"`.
    pub fn registered_name(&self) -> String {
        match self.cluster {
            Some(i) => format!("{}{}", self.model_type, i),
            None => self.model_type.clone(),
        }
    }

    /// Score metric key: `"<model-type><index?>-best_score"`.
    pub fn metric_key(&self) -> String {
        format!("{}{}", self.registered_name(), BEST_SCORE_SUFFIX)
    }

    /// Artifact key: `"<dir>/<model-type><index?>.<format>"`.
    pub fn artifact_key(&self, dir: &str, format: &str) -> String {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            format!("{}.{}", self.registered_name(), format)
        } else {
            format!("{}/{}.{}", dir, self.registered_name(), format)
        }
    }

    /// Parse a registered model name back into its key.
    ///
    /// A trailing run of ASCII digits is the cluster index; everything before
    /// it is the model type.  Returns `None` for an empty name or a name made
    /// only of digits.
    pub fn parse_registered(name: &str) -> Option<Self> {
        let digits = name.bytes().rev().take_while(u8::is_ascii_digit).count();
        let split = name.len() - digits;
        let (model_type, index) = name.split_at(split);
        if model_type.is_empty() {
            return None;
        }
        if index.is_empty() {
            return Some(Self::global(model_type));
        }
        index.parse().ok().map(|i| Self::for_cluster(model_type, i))
    }

    /// Parse a score metric key (`"<name>-best_score"`).
    pub fn parse_metric(key: &str) -> Option<Self> {
        key.strip_suffix(BEST_SCORE_SUFFIX).and_then(Self::parse_registered)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.registered_name())
    }
}

/// Data-source key of one cluster's exported table.
pub fn cluster_table_key(feature_store: &str, cluster: usize) -> String {
    format!("{}{}", cluster_table_prefix(feature_store), cluster)
}

/// Common prefix of every cluster table; used with `ArtifactStore::list`.
pub fn cluster_table_prefix(feature_store: &str) -> String {
    format!("{}/cluster-", feature_store.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
