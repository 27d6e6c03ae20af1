//! Reference classifiers used by the default configuration.
//!
//! Both are small and dependency-free so the cycle can be exercised end to
//! end; production deployments register their own [`ModelType`]s.

use serde::{Deserialize, Serialize};

use super::params::{get_choice, get_usize};
use super::{FittedModel, ModelError, ModelType, ParamSet};
use crate::dataset::{squared_distance, Dataset, Label};

// ---------------------------------------------------------------------------
// Distance metric
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Euclidean,
    Manhattan,
}

impl Metric {
    fn parse(params: &ParamSet) -> Result<Self, ModelError> {
        match get_choice(params, "metric", &["euclidean", "manhattan"], "euclidean")? {
            "manhattan" => Ok(Metric::Manhattan),
            _ => Ok(Metric::Euclidean),
        }
    }

    fn distance(self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Metric::Euclidean => squared_distance(a, b).sqrt(),
            Metric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// NearestCentroid
// ---------------------------------------------------------------------------

/// Predicts the class whose mean feature vector is closest.
///
/// Hyperparameters: `metric` ∈ {`euclidean`, `manhattan`}.
pub struct NearestCentroid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestCentroidModel {
    pub metric: Metric,
    /// (class, centroid) in ascending class order.
    pub centroids: Vec<(Label, Vec<f64>)>,
}

impl FittedModel for NearestCentroidModel {
    fn predict(&self, row: &[f64]) -> Label {
        let mut best: Option<(Label, f64)> = None;
        for (class, centroid) in &self.centroids {
            let d = self.metric.distance(row, centroid);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((*class, d));
            }
        }
        best.map_or(0, |(class, _)| class)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Encode(e.to_string()))
    }
}

impl ModelType for NearestCentroid {
    fn kind(&self) -> &str {
        "nearest_centroid"
    }

    fn fit(&self, params: &ParamSet, data: &Dataset) -> Result<Box<dyn FittedModel>, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let metric = Metric::parse(params)?;
        let width = data.width();
        let centroids = data
            .classes()
            .into_iter()
            .map(|class| {
                let mut sum = vec![0.0; width];
                let mut n = 0usize;
                for (row, _) in data.features().iter().zip(data.labels()).filter(|(_, l)| **l == class) {
                    n += 1;
                    for (s, v) in sum.iter_mut().zip(row) {
                        *s += v;
                    }
                }
                let centroid = sum.into_iter().map(|s| s / n as f64).collect();
                (class, centroid)
            })
            .collect();
        Ok(Box::new(NearestCentroidModel { metric, centroids }))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn FittedModel>, ModelError> {
        let model: NearestCentroidModel =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))?;
        Ok(Box::new(model))
    }
}

// ---------------------------------------------------------------------------
// KNearest
// ---------------------------------------------------------------------------

/// k-nearest-neighbour vote over the stored training rows.
///
/// Hyperparameters: `k` (positive integer, clamped to the training size),
/// `weights` ∈ {`uniform`, `distance`}, `metric` as for [`NearestCentroid`].
pub struct KNearest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KNearestModel {
    pub k: usize,
    pub distance_weighted: bool,
    pub metric: Metric,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<Label>,
}

impl FittedModel for KNearestModel {
    fn predict(&self, row: &[f64]) -> Label {
        let mut neighbours: Vec<(f64, Label)> = self
            .rows
            .iter()
            .zip(&self.labels)
            .map(|(r, &l)| (self.metric.distance(row, r), l))
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        neighbours.truncate(self.k);

        let mut votes: Vec<(Label, f64)> = Vec::new();
        for (d, label) in neighbours {
            let w = if self.distance_weighted { 1.0 / (d + 1e-9) } else { 1.0 };
            match votes.iter_mut().find(|(l, _)| *l == label) {
                Some((_, total)) => *total += w,
                None => votes.push((label, w)),
            }
        }
        // Highest vote; ties go to the smallest label.
        votes
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map_or(0, |(label, _)| label)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Encode(e.to_string()))
    }
}

impl ModelType for KNearest {
    fn kind(&self) -> &str {
        "k_nearest"
    }

    fn fit(&self, params: &ParamSet, data: &Dataset) -> Result<Box<dyn FittedModel>, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let k = get_usize(params, "k", 5)?.min(data.len());
        let distance_weighted =
            get_choice(params, "weights", &["uniform", "distance"], "uniform")? == "distance";
        let metric = Metric::parse(params)?;
        Ok(Box::new(KNearestModel {
            k,
            distance_weighted,
            metric,
            rows: data.features().to_vec(),
            labels: data.labels().to_vec(),
        }))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn FittedModel>, ModelError> {
        let model: KNearestModel =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))?;
        if model.k == 0 || model.rows.len() != model.labels.len() {
            return Err(ModelError::Decode("inconsistent k-nearest state".into()));
        }
        Ok(Box::new(model))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{accuracy, ParamValue};

    fn two_classes() -> Dataset {
        Dataset::new(
            vec![
                vec![0.0, 0.0],
                vec![0.5, 0.2],
                vec![0.2, 0.4],
                vec![5.0, 5.0],
                vec![5.5, 4.8],
                vec![4.7, 5.2],
            ],
            vec![0, 0, 0, 1, 1, 1],
        )
        .unwrap()
    }

    fn params(pairs: &[(&str, ParamValue)]) -> ParamSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn nearest_centroid_separates_classes() {
        let model = NearestCentroid.fit(&ParamSet::new(), &two_classes()).unwrap();
        assert_eq!(model.predict(&[0.1, 0.1]), 0);
        assert_eq!(model.predict(&[4.9, 5.1]), 1);
        assert_eq!(accuracy(model.as_ref(), &two_classes()), 1.0);
    }

    #[test]
    fn nearest_centroid_accepts_manhattan() {
        let p = params(&[("metric", ParamValue::Text("manhattan".into()))]);
        let model = NearestCentroid.fit(&p, &two_classes()).unwrap();
        assert_eq!(model.predict(&[5.0, 5.0]), 1);
    }

    #[test]
    fn nearest_centroid_rejects_unknown_metric() {
        let p = params(&[("metric", ParamValue::Text("cosine".into()))]);
        assert!(matches!(
            NearestCentroid.fit(&p, &two_classes()),
            Err(ModelError::InvalidParam { .. })
        ));
    }

    #[test]
    fn knearest_votes_by_majority() {
        let p = params(&[("k", ParamValue::Int(3))]);
        let model = KNearest.fit(&p, &two_classes()).unwrap();
        assert_eq!(model.predict(&[0.3, 0.3]), 0);
        assert_eq!(model.predict(&[5.1, 5.0]), 1);
    }

    #[test]
    fn knearest_clamps_k_to_training_size() {
        let p = params(&[("k", ParamValue::Int(50))]);
        let model = KNearest.fit(&p, &two_classes()).unwrap();
        // Uniform vote over all six rows is a 3/3 tie; smallest label wins.
        assert_eq!(model.predict(&[100.0, 100.0]), 0);
    }

    #[test]
    fn knearest_distance_weighting_breaks_ties_by_proximity() {
        let p = params(&[("k", ParamValue::Int(6)), ("weights", ParamValue::Text("distance".into()))]);
        let model = KNearest.fit(&p, &two_classes()).unwrap();
        assert_eq!(model.predict(&[5.0, 5.0]), 1);
    }

    #[test]
    fn empty_training_set_is_rejected() {
        let empty = Dataset::new(vec![], vec![]).unwrap();
        assert!(matches!(KNearest.fit(&ParamSet::new(), &empty), Err(ModelError::EmptyTrainingSet)));
        assert!(matches!(
            NearestCentroid.fit(&ParamSet::new(), &empty),
            Err(ModelError::EmptyTrainingSet)
        ));
    }

    #[test]
    fn artifacts_reload_with_same_predictions() {
        let data = two_classes();
        for model_type in [&NearestCentroid as &dyn ModelType, &KNearest] {
            let fitted = model_type.fit(&ParamSet::new(), &data).unwrap();
            let restored = model_type.load(&fitted.to_bytes().unwrap()).unwrap();
            for row in data.features() {
                assert_eq!(fitted.predict(row), restored.predict(row));
            }
        }
    }
}
