//! # Stage: Hyperparameter Search
//!
//! ## Responsibility
//! Pick the hyperparameter set of one model type that maximises validation
//! score on a training subset.  The strategy is pluggable through
//! [`SearchStrategy`]; the trainer only relies on "best of search" semantics.
//!
//! ## Guarantees
//! - Deterministic: grid points are visited in [`ParamGrid::combinations`]
//!   order and folds are contiguous blocks of the (already shuffled) input
//! - Ties go to the first grid point found
//! - A grid point whose fit fails is skipped; the search fails only when
//!   every point fails
//!
//! ## NOT Responsible For
//! - The final refit and held-out scoring (see `trainer`)

use tracing::debug;

use crate::dataset::Dataset;
use crate::model::{accuracy, ModelError, ModelType, ParamGrid, ParamSet};

/// Winning grid point of a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub params: ParamSet,
    /// Mean validation score of the winning point.
    pub validation_score: f64,
    /// Grid points that produced a score.
    pub evaluated: usize,
}

/// Strategy that proposes the best hyperparameters for a model type.
pub trait SearchStrategy: Send + Sync {
    fn search(
        &self,
        model: &dyn ModelType,
        grid: &ParamGrid,
        train: &Dataset,
    ) -> Result<SearchOutcome, ModelError>;
}

// ---------------------------------------------------------------------------
// GridSearch
// ---------------------------------------------------------------------------

/// Exhaustive grid search scored by k-fold cross-validated accuracy.
#[derive(Debug, Clone)]
pub struct GridSearch {
    pub folds: usize,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self { folds: 3 }
    }
}

/// Contiguous k-fold split of `0..n`: returns (train, validation) index pairs.
/// The first `n % folds` folds get one extra row.
pub fn kfold_indices(n: usize, folds: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
    let folds = folds.min(n).max(1);
    let base = n / folds;
    let extra = n % folds;
    let mut out = Vec::with_capacity(folds);
    let mut start = 0;
    for f in 0..folds {
        let len = base + usize::from(f < extra);
        let validation: Vec<usize> = (start..start + len).collect();
        let train: Vec<usize> = (0..start).chain(start + len..n).collect();
        out.push((train, validation));
        start += len;
    }
    out
}

impl GridSearch {
    fn score_point(
        &self,
        model: &dyn ModelType,
        params: &ParamSet,
        train: &Dataset,
    ) -> Result<f64, ModelError> {
        // With fewer than two rows there is nothing to hold out.
        if train.len() < 2 {
            let fitted = model.fit(params, train)?;
            return Ok(accuracy(fitted.as_ref(), train));
        }
        let splits = kfold_indices(train.len(), self.folds.max(2));
        let mut total = 0.0;
        for (fit_idx, val_idx) in &splits {
            let fitted = model.fit(params, &train.subset(fit_idx))?;
            total += accuracy(fitted.as_ref(), &train.subset(val_idx));
        }
        Ok(total / splits.len() as f64)
    }
}

impl SearchStrategy for GridSearch {
    fn search(
        &self,
        model: &dyn ModelType,
        grid: &ParamGrid,
        train: &Dataset,
    ) -> Result<SearchOutcome, ModelError> {
        if train.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let mut best: Option<SearchOutcome> = None;
        let mut last_err = None;
        let mut evaluated = 0;

        for params in grid.combinations() {
            match self.score_point(model, &params, train) {
                Ok(score) => {
                    evaluated += 1;
                    debug!(target: "pipeline::search", kind = model.kind(), ?params, score, "grid point scored");
                    if best.as_ref().map_or(true, |b| score > b.validation_score) {
                        best = Some(SearchOutcome { params, validation_score: score, evaluated: 0 });
                    }
                }
                Err(e) => {
                    debug!(target: "pipeline::search", kind = model.kind(), ?params, error = %e, "grid point failed");
                    last_err = Some(e);
                }
            }
        }

        match best {
            Some(mut outcome) => {
                outcome.evaluated = evaluated;
                Ok(outcome)
            }
            None => Err(last_err.unwrap_or(ModelError::Other("empty search grid".into()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
