//! # Stage: Production Prediction
//!
//! ## Responsibility
//! Serve the models a promotion cycle put in `Production`: route each input
//! row through the production clustering model, then predict its label with
//! the production model of that cluster.
//!
//! ## Guarantees
//! - Only live versions are loaded: a name is served when its latest version
//!   is in `Production`; an older version still marked `Production` was
//!   superseded and is never served
//! - A cluster without a loadable production model never fails the batch;
//!   its rows come back with `label: None` and the cluster is listed in
//!   [`PredictionBatch::unscored_clusters`]
//!
//! ## NOT Responsible For
//! - Choosing production models (see `promotion`, `transition`)
//! - Writing predictions anywhere (the caller's concern)

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::dataset::Label;
use crate::error::{PipelineError, PipelineResult};
use crate::keys::ModelKey;
use crate::model::{Clusterer, FittedClustering, FittedModel, ModelCatalog};
use crate::registry::{ExperimentRegistry, ModelVersion, Stage};
use crate::store::ArtifactStore;

/// Prediction for one input row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub row: usize,
    pub cluster: usize,
    /// `None` when the cluster has no production model.
    pub label: Option<Label>,
    /// Registered name of the model that produced `label`.
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionBatch {
    pub predictions: Vec<Prediction>,
    /// Clusters that received rows but have no production model, ascending.
    pub unscored_clusters: Vec<usize>,
}

/// Latest version of `name`, when that version is in `Production`.
pub fn live_version(
    registry: &dyn ExperimentRegistry,
    name: &str,
) -> PipelineResult<Option<ModelVersion>> {
    Ok(registry.latest_version(name)?.filter(|v| v.stage == Stage::Production))
}

/// The production clustering model plus one production model per cluster.
pub struct Predictor {
    clustering: Box<dyn FittedClustering>,
    models: BTreeMap<usize, (String, Box<dyn FittedModel>)>,
}

impl Predictor {
    /// Load the production models named by `clustering_name` and `catalog`.
    ///
    /// # Errors
    /// - `NoProductionModel` when the clustering model has no production version
    /// - `StoreUnavailable` / `Model` when its artifact cannot be loaded
    pub fn load(
        clustering_name: &str,
        clusterer: &dyn Clusterer,
        catalog: &ModelCatalog,
        store: &dyn ArtifactStore,
        registry: &dyn ExperimentRegistry,
    ) -> PipelineResult<Self> {
        let version = live_version(registry, clustering_name)?
            .ok_or_else(|| PipelineError::NoProductionModel(clustering_name.to_string()))?;
        let clustering = clusterer.load(&store.get(&version.artifact_key)?)?;

        let mut models = BTreeMap::new();
        for cluster in 0..clustering.k() {
            for entry in catalog.entries() {
                let name = ModelKey::for_cluster(entry.name.as_str(), cluster).registered_name();
                let Some(v) = live_version(registry, &name)? else {
                    continue;
                };
                let loaded = store
                    .get(&v.artifact_key)
                    .and_then(|bytes| entry.model.load(&bytes).map_err(PipelineError::from));
                match loaded {
                    Ok(model) => {
                        models.insert(cluster, (name, model));
                        break;
                    }
                    Err(e) => {
                        warn!(target: "pipeline::predict", cluster, name = %name, error = %e, "production model not loadable");
                    }
                }
            }
        }
        info!(
            target: "pipeline::predict",
            clusters = clustering.k(),
            loaded = models.len(),
            "production models loaded"
        );
        Ok(Self { clustering, models })
    }

    pub fn cluster_count(&self) -> usize {
        self.clustering.k()
    }

    /// Registered name of the production model serving `cluster`.
    pub fn model_for(&self, cluster: usize) -> Option<&str> {
        self.models.get(&cluster).map(|(name, _)| name.as_str())
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> PredictionBatch {
        let mut unscored = Vec::new();
        let predictions = rows
            .iter()
            .enumerate()
            .map(|(row, features)| {
                let cluster = self.clustering.assign(features);
                match self.models.get(&cluster) {
                    Some((name, model)) => Prediction {
                        row,
                        cluster,
                        label: Some(model.predict(features)),
                        model: Some(name.clone()),
                    },
                    None => {
                        unscored.push(cluster);
                        Prediction { row, cluster, label: None, model: None }
                    }
                }
            })
            .collect();
        unscored.sort_unstable();
        unscored.dedup();
        if !unscored.is_empty() {
            warn!(target: "pipeline::predict", clusters = ?unscored, "rows left unscored");
        }
        PredictionBatch { predictions, unscored_clusters: unscored }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dataset::Dataset;
    use crate::model::kmeans::KMeans;
    use crate::model::{ModelType, ParamSet};
    use crate::model::classifiers::NearestCentroid;
    use crate::registry::InMemoryRegistry;
    use crate::store::InMemoryArtifactStore;

    /// Registers a two-cluster KMeans plus one classifier for cluster 0.
    fn fixture() -> (InMemoryArtifactStore, InMemoryRegistry, ModelCatalog) {
        let store = InMemoryArtifactStore::new();
        let registry = InMemoryRegistry::new();
        let catalog = ModelCatalog::from_specs(&PipelineConfig::default().training.models);

        let rows = vec![vec![0.0], vec![0.5], vec![10.0], vec![10.5]];
        let km = KMeans::default().fit(2, &rows).unwrap();
        store.put("models/KMeans.json", &km.to_bytes().unwrap()).unwrap();
        registry.register_model_version("KMeans", None, "models/KMeans.json").unwrap();
        registry.set_stage("KMeans", 1, Stage::Production).unwrap();

        let cluster0 = km.assign(&[0.0]);
        let data = Dataset::new(vec![vec![0.0], vec![0.5]], vec![7, 8]).unwrap();
        let model = NearestCentroid.fit(&ParamSet::new(), &data).unwrap();
        let name = format!("NearestCentroid{}", cluster0);
        let key = format!("models/{}.json", name);
        store.put(&key, &model.to_bytes().unwrap()).unwrap();
        registry.register_model_version(&name, None, &key).unwrap();
        registry.set_stage(&name, 1, Stage::Production).unwrap();

        (store, registry, catalog)
    }

    #[test]
    fn rows_route_through_their_cluster_model() {
        let (store, registry, catalog) = fixture();
        let predictor = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry).unwrap();
        assert_eq!(predictor.cluster_count(), 2);

        let batch = predictor.predict(&[vec![0.1], vec![0.45], vec![10.2]]);
        assert_eq!(batch.predictions[0].label, Some(7));
        assert_eq!(batch.predictions[1].label, Some(8));
        assert!(batch.predictions[0].model.as_deref().unwrap().starts_with("NearestCentroid"));
    }

    #[test]
    fn cluster_without_production_model_is_unscored() {
        let (store, registry, catalog) = fixture();
        let predictor = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry).unwrap();
        let batch = predictor.predict(&[vec![10.2]]);
        assert_eq!(batch.predictions[0].label, None);
        assert_eq!(batch.unscored_clusters, vec![batch.predictions[0].cluster]);
    }

    #[test]
    fn staging_versions_are_not_served() {
        let (store, registry, catalog) = fixture();
        for name in registry.registered_names().unwrap() {
            if name != "KMeans" {
                registry.set_stage(&name, 1, Stage::Staging).unwrap();
            }
        }
        let predictor = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry).unwrap();
        assert!(predictor.model_for(0).is_none());
        assert!(predictor.model_for(1).is_none());
    }

    #[test]
    fn superseded_production_version_is_not_served() {
        let (store, registry, catalog) = fixture();
        let name = registry
            .registered_names()
            .unwrap()
            .into_iter()
            .find(|n| n != "KMeans")
            .unwrap();
        // v2 lost the latest promotion; v1 was never moved out of Production.
        let v2 = registry.register_model_version(&name, None, &format!("models/{}.json", name)).unwrap();
        registry.set_stage(&name, v2.version, Stage::Staging).unwrap();

        let predictor = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry).unwrap();
        let batch = predictor.predict(&[vec![0.1]]);
        assert_eq!(batch.predictions[0].label, None);
        assert!(live_version(&registry, &name).unwrap().is_none());
    }

    #[test]
    fn missing_clustering_model_is_an_error() {
        let store = InMemoryArtifactStore::new();
        let registry = InMemoryRegistry::new();
        let catalog = ModelCatalog::new();
        let err = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::NoProductionModel(name) if name == "KMeans"));
    }

    #[test]
    fn unloadable_artifact_leaves_cluster_unscored() {
        let (store, registry, catalog) = fixture();
        for name in registry.registered_names().unwrap() {
            if name != "KMeans" {
                store.put(&format!("models/{}.json", name), b"corrupt").unwrap();
            }
        }
        let predictor = Predictor::load("KMeans", &KMeans::default(), &catalog, &store, &registry).unwrap();
        let batch = predictor.predict(&[vec![0.1]]);
        assert_eq!(batch.predictions[0].label, None);
    }
}
