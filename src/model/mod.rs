//! # Module: model
//!
//! Pluggable model implementations.  The cycle never depends on a concrete
//! algorithm: it fits clusterings through [`Clusterer`] and classifiers
//! through [`ModelType`], and persists/restores both as opaque bytes.
//!
//! ## Sub-modules
//! - [`params`]      — hyperparameter values and search grids
//! - [`kmeans`]      — reference k-means clusterer
//! - [`classifiers`] — reference nearest-centroid and k-nearest classifiers
//!
//! ## NOT Responsible For
//! - Choosing hyperparameters (see `search`)
//! - Persisting bytes (see `store`)

pub mod classifiers;
pub mod kmeans;
pub mod params;

use thiserror::Error;

use crate::config::{ModelKind, ModelSpec};
use crate::dataset::{Dataset, Label};

pub use params::{ParamGrid, ParamSet, ParamValue};

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Failures raised by a model implementation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid hyperparameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("cannot fit on an empty training set")]
    EmptyTrainingSet,

    #[error("requested {k} clusters from {rows} rows")]
    TooFewRows { k: usize, rows: usize },

    #[error("could not decode model artifact: {0}")]
    Decode(String),

    #[error("could not encode model artifact: {0}")]
    Encode(String),

    /// Catch-all for third-party implementations.
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Classification traits
// ---------------------------------------------------------------------------

/// A fitted classifier.
pub trait FittedModel: Send + Sync {
    /// Predict the label of one feature row.
    fn predict(&self, row: &[f64]) -> Label;

    /// Serialise the fitted state for the artifact store.
    fn to_bytes(&self) -> Result<Vec<u8>, ModelError>;
}

/// A trainable model type.
///
/// This trait is object-safe so heterogeneous model types can live in one
/// [`ModelCatalog`].
pub trait ModelType: Send + Sync {
    /// Stable identifier of the implementation (not the registered name).
    fn kind(&self) -> &str;

    /// Fit on `data` with the given hyperparameters.
    fn fit(&self, params: &ParamSet, data: &Dataset) -> Result<Box<dyn FittedModel>, ModelError>;

    /// Restore a model previously produced by [`FittedModel::to_bytes`].
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn FittedModel>, ModelError>;
}

/// Fraction of rows whose prediction equals the label.  Higher is better.
///
/// Returns 0.0 for an empty dataset.
pub fn accuracy(model: &dyn FittedModel, data: &Dataset) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let correct = data
        .features()
        .iter()
        .zip(data.labels())
        .filter(|&(row, &label)| model.predict(row) == label)
        .count();
    correct as f64 / data.len() as f64
}

// ---------------------------------------------------------------------------
// Clustering traits
// ---------------------------------------------------------------------------

/// A fitted clustering.
pub trait FittedClustering: Send + Sync {
    /// Number of clusters the model was fitted with.
    fn k(&self) -> usize;

    /// Within-cluster sum of squared distances on the training rows.
    fn wcss(&self) -> f64;

    /// Cluster index in `0..k()` for one row.
    fn assign(&self, row: &[f64]) -> usize;

    fn to_bytes(&self) -> Result<Vec<u8>, ModelError>;
}

/// A clustering algorithm parameterised by cluster count.
pub trait Clusterer: Send + Sync {
    fn fit(&self, k: usize, rows: &[Vec<f64>]) -> Result<Box<dyn FittedClustering>, ModelError>;

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn FittedClustering>, ModelError>;
}

// ---------------------------------------------------------------------------
// ModelCatalog
// ---------------------------------------------------------------------------

/// One registered model type together with its search grid.
pub struct CatalogEntry {
    pub name: String,
    pub model: Box<dyn ModelType>,
    pub grid: ParamGrid,
}

/// Ordered set of model types trained per cluster.
///
/// Order only affects log readability; selection never depends on it.
#[derive(Default)]
pub struct ModelCatalog {
    entries: Vec<CatalogEntry>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog declared in configuration.
    pub fn from_specs(specs: &[ModelSpec]) -> Self {
        let mut catalog = Self::new();
        for spec in specs {
            let model: Box<dyn ModelType> = match spec.kind {
                ModelKind::NearestCentroid => Box::new(classifiers::NearestCentroid),
                ModelKind::KNearest => Box::new(classifiers::KNearest),
            };
            catalog.register(spec.name.clone(), model, spec.grid.clone());
        }
        catalog
    }

    /// Add a model type.  A later entry with the same name replaces the earlier one.
    pub fn register(&mut self, name: impl Into<String>, model: Box<dyn ModelType>, grid: ParamGrid) {
        let name = name.into();
        self.entries.retain(|e| e.name != name);
        self.entries.push(CatalogEntry { name, model, grid });
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(Label);

    impl FittedModel for Constant {
        fn predict(&self, _row: &[f64]) -> Label {
            self.0
        }

        fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
            Ok(self.0.to_le_bytes().to_vec())
        }
    }

    struct ConstantType;

    impl ModelType for ConstantType {
        fn kind(&self) -> &str {
            "constant"
        }

        fn fit(&self, _params: &ParamSet, _data: &Dataset) -> Result<Box<dyn FittedModel>, ModelError> {
            Ok(Box::new(Constant(1)))
        }

        fn load(&self, _bytes: &[u8]) -> Result<Box<dyn FittedModel>, ModelError> {
            Ok(Box::new(Constant(1)))
        }
    }

    #[test]
    fn accuracy_counts_matches() {
        let data = Dataset::new(vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]], vec![1, 1, 0, 1])
            .unwrap();
        assert!((accuracy(&Constant(1), &data) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn accuracy_of_empty_dataset_is_zero() {
        let data = Dataset::new(vec![], vec![]).unwrap();
        assert_eq!(accuracy(&Constant(0), &data), 0.0);
    }

    #[test]
    fn catalog_keeps_registration_order() {
        let mut catalog = ModelCatalog::new();
        catalog.register("B", Box::new(ConstantType), ParamGrid::new());
        catalog.register("A", Box::new(ConstantType), ParamGrid::new());
        assert_eq!(catalog.names(), vec!["B", "A"]);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn catalog_register_replaces_same_name() {
        let mut catalog = ModelCatalog::new();
        catalog.register("A", Box::new(ConstantType), ParamGrid::new());
        catalog.register("A", Box::new(ConstantType), ParamGrid::new().with("x", vec![]));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("A").unwrap().grid.0.contains_key("x"));
    }

    #[test]
    fn catalog_from_specs_instantiates_kinds() {
        let specs = vec![
            ModelSpec { name: "NC".into(), kind: ModelKind::NearestCentroid, grid: ParamGrid::new() },
            ModelSpec { name: "KN".into(), kind: ModelKind::KNearest, grid: ParamGrid::new() },
        ];
        let catalog = ModelCatalog::from_specs(&specs);
        assert_eq!(catalog.get("NC").unwrap().model.kind(), "nearest_centroid");
        assert_eq!(catalog.get("KN").unwrap().model.kind(), "k_nearest");
        assert!(catalog.get("missing").is_none());
    }
}
