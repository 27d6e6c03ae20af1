//! Reference k-means clusterer: k-means++ seeding followed by Lloyd
//! iterations.  Seeded, so a given (rows, k, seed) always yields the same
//! centroids.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Clusterer, FittedClustering, ModelError};
use crate::dataset::squared_distance;

/// k-means algorithm settings.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self { max_iter: 300, seed: 42 }
    }
}

/// Fitted k-means state: one centroid per cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    pub centroids: Vec<Vec<f64>>,
    pub wcss: f64,
}

impl KMeansModel {
    fn nearest(&self, row: &[f64]) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (i, c) in self.centroids.iter().enumerate() {
            let d = squared_distance(row, c);
            if d < best.1 {
                best = (i, d);
            }
        }
        best
    }
}

impl FittedClustering for KMeansModel {
    fn k(&self) -> usize {
        self.centroids.len()
    }

    fn wcss(&self) -> f64 {
        self.wcss
    }

    fn assign(&self, row: &[f64]) -> usize {
        self.nearest(row).0
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Encode(e.to_string()))
    }
}

impl KMeans {
    /// k-means++: first centroid uniform, the rest drawn proportional to the
    /// squared distance from the nearest centroid already chosen.
    fn seed_centroids(&self, k: usize, rows: &[Vec<f64>], rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut centroids = Vec::with_capacity(k);
        centroids.push(rows[rng.gen_range(0..rows.len())].clone());
        let mut dist: Vec<f64> = rows.iter().map(|r| squared_distance(r, &centroids[0])).collect();

        while centroids.len() < k {
            let total: f64 = dist.iter().sum();
            let next = if total <= 0.0 {
                rng.gen_range(0..rows.len())
            } else {
                let mut target = rng.gen::<f64>() * total;
                let mut chosen = rows.len() - 1;
                for (i, d) in dist.iter().enumerate() {
                    if target < *d {
                        chosen = i;
                        break;
                    }
                    target -= d;
                }
                chosen
            };
            let centroid = rows[next].clone();
            for (d, r) in dist.iter_mut().zip(rows) {
                *d = d.min(squared_distance(r, &centroid));
            }
            centroids.push(centroid);
        }
        centroids
    }

    /// Fit k centroids to `rows`; returns the concrete model.
    pub fn fit_model(&self, k: usize, rows: &[Vec<f64>]) -> Result<KMeansModel, ModelError> {
        if rows.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if k == 0 {
            return Err(ModelError::InvalidParam { name: "k".into(), reason: "must be >= 1".into() });
        }
        if rows.len() < k {
            return Err(ModelError::TooFewRows { k, rows: rows.len() });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let width = rows[0].len();
        let mut model = KMeansModel { centroids: self.seed_centroids(k, rows, &mut rng), wcss: 0.0 };
        let mut assignment = vec![usize::MAX; rows.len()];

        for _ in 0..self.max_iter.max(1) {
            let mut changed = false;
            for (slot, row) in assignment.iter_mut().zip(rows) {
                let (c, _) = model.nearest(row);
                if *slot != c {
                    *slot = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0; width]; k];
            let mut counts = vec![0usize; k];
            for (&c, row) in assignment.iter().zip(rows) {
                counts[c] += 1;
                for (s, v) in sums[c].iter_mut().zip(row) {
                    *s += v;
                }
            }
            // Empty clusters keep their previous centroid.
            for c in 0..k {
                if counts[c] > 0 {
                    let n = counts[c] as f64;
                    model.centroids[c] = sums[c].iter().map(|s| s / n).collect();
                }
            }
        }

        model.wcss = rows.iter().map(|r| model.nearest(r).1).sum();
        Ok(model)
    }
}

impl Clusterer for KMeans {
    fn fit(&self, k: usize, rows: &[Vec<f64>]) -> Result<Box<dyn FittedClustering>, ModelError> {
        Ok(Box::new(self.fit_model(k, rows)?))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn FittedClustering>, ModelError> {
        let model: KMeansModel =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))?;
        if model.centroids.is_empty() {
            return Err(ModelError::Decode("model has no centroids".into()));
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

    fn blobs() -> Vec<Vec<f64>> {
        let mut rows = Vec::new();
        for center in [0.0, 10.0, 20.0] {
            for i in 0..5 {
                rows.push(vec![center + i as f64 * 0.1, center - i as f64 * 0.1]);
            }
        }
        rows
    }

    #[test]
    fn separates_well_spaced_blobs() {
        let model = KMeans::default().fit_model(3, &blobs()).unwrap();
        let rows = blobs();
        let a = model.assign(&rows[0]);
        let b = model.assign(&rows[5]);
        let c = model.assign(&rows[10]);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        for i in 0..5 {
            assert_eq!(model.assign(&rows[i]), a);
        }
    }

    #[test]
    fn wcss_decreases_with_more_clusters() {
        let km = KMeans::default();
        let w1 = km.fit_model(1, &blobs()).unwrap().wcss;
        let w3 = km.fit_model(3, &blobs()).unwrap().wcss;
        assert!(w3 < w1);
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let km = KMeans { max_iter: 50, seed: 7 };
        assert_eq!(km.fit_model(2, &blobs()).unwrap(), km.fit_model(2, &blobs()).unwrap());
    }

    #[test]
    fn k_equal_to_rows_gives_zero_wcss() {
        let rows = vec![vec![0.0], vec![5.0], vec![9.0]];
        let model = KMeans::default().fit_model(3, &rows).unwrap();
        assert!(model.wcss.abs() < 1e-12);
    }

    #[test]
    fn duplicate_rows_do_not_panic() {
        let rows = vec![vec![1.0, 1.0]; 6];
        let model = KMeans::default().fit_model(3, &rows).unwrap();
        assert_eq!(model.k(), 3);
        assert_eq!(model.wcss, 0.0);
    }

    #[test]
    fn rejects_degenerate_requests() {
        let km = KMeans::default();
        assert!(matches!(km.fit_model(1, &[]), Err(ModelError::EmptyTrainingSet)));
        assert!(matches!(km.fit_model(0, &blobs()), Err(ModelError::InvalidParam { .. })));
        assert!(matches!(
            km.fit_model(4, &[vec![0.0], vec![1.0]]),
            Err(ModelError::TooFewRows { k: 4, rows: 2 })
        ));
    }

    #[test]
    fn load_restores_assignments() {
        let km = KMeans::default();
        let fitted = km.fit(3, &blobs()).unwrap();
        let restored = km.load(&fitted.to_bytes().unwrap()).unwrap();
        for row in blobs() {
            assert_eq!(fitted.assign(&row), restored.assign(&row));
        }
    }

    #[test]
    fn load_rejects_garbage() {
        assert!(KMeans::default().load(b"not json").is_err());
        assert!(KMeans::default().load(br#"{"centroids":[],"wcss":0.0}"#).is_err());
    }
}
