//! # Stage: Lifecycle Transition Applier
//!
//! ## Responsibility
//! The single point where a promotion decision becomes externally visible.
//! Moves the latest version of every registered model to `Production` (the
//! clustering model, and each cluster's winner) or `Staging` (everything
//! else), then retires older versions still left in `Production`.
//!
//! ## Guarantees
//! - Best-effort: versions are applied independently; a failed transition is
//!   logged at `warn`, recorded as [`TransitionOutcome::Failed`], and never
//!   blocks the remaining versions
//! - Ordered: versions are applied in the order given
//! - Auditable: every version yields one [`TransitionRecord`]
//! - At most one `Production` version per name: a superseded version still
//!   in `Production` is moved to `Staging`
//! - Never creates or deletes versions, only changes stages
//!
//! ## NOT Responsible For
//! - Computing the decision (see `promotion`)
//! - Retrying failed transitions (collaborator wrapper's concern)

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::promotion::PromotionDecision;
use crate::registry::{ExperimentRegistry, ModelVersion, Stage};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to one model version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The registry accepted the new stage.
    Applied,
    /// The version was already in the target stage; nothing was sent.
    Unchanged,
    /// The registry refused or failed the change.
    Failed { reason: String },
}

/// The audit entry for one model version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub name: String,
    pub version: u64,
    pub from: Stage,
    pub to: Stage,
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
}

impl TransitionRecord {
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, TransitionOutcome::Failed { .. })
    }
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Target stage of the registered model `name` under `decision`.
pub fn target_stage(decision: &PromotionDecision, name: &str) -> Stage {
    if decision.is_promoted(name) {
        Stage::Production
    } else {
        Stage::Staging
    }
}

/// Apply `decision` to `versions` (the latest version of each registered
/// model) through `registry`.
pub fn apply(
    decision: &PromotionDecision,
    versions: &[ModelVersion],
    registry: &dyn ExperimentRegistry,
) -> Vec<TransitionRecord> {
    let records: Vec<TransitionRecord> = versions
        .iter()
        .map(|v| transition(v, target_stage(decision, &v.name), registry))
        .collect();

    let production = records.iter().filter(|r| r.succeeded() && r.to == Stage::Production).count();
    let failed = records.iter().filter(|r| !r.succeeded()).count();
    info!(
        target: "pipeline::transition",
        versions = records.len(),
        production,
        staging = records.len() - production - failed,
        failed,
        "stage transitions applied"
    );
    records
}

/// Move every version in `versions` that is still in `Production` but is
/// not the latest of its name to `Staging`.
pub fn retire_superseded(versions: &[ModelVersion], registry: &dyn ExperimentRegistry) -> Vec<TransitionRecord> {
    let mut latest: BTreeMap<&str, u64> = BTreeMap::new();
    for v in versions {
        let entry = latest.entry(v.name.as_str()).or_insert(v.version);
        *entry = (*entry).max(v.version);
    }
    let records: Vec<TransitionRecord> = versions
        .iter()
        .filter(|v| v.stage == Stage::Production && latest.get(v.name.as_str()) != Some(&v.version))
        .map(|v| transition(v, Stage::Staging, registry))
        .collect();
    if !records.is_empty() {
        info!(target: "pipeline::transition", retired = records.len(), "superseded production versions retired");
    }
    records
}

fn transition(v: &ModelVersion, to: Stage, registry: &dyn ExperimentRegistry) -> TransitionRecord {
    let outcome = if v.stage == to {
        TransitionOutcome::Unchanged
    } else {
        match registry.set_stage(&v.name, v.version, to) {
            Ok(()) => TransitionOutcome::Applied,
            Err(e) => {
                warn!(
                    target: "pipeline::transition",
                    name = %v.name,
                    version = v.version,
                    to = %to,
                    error = %e,
                    "stage transition failed"
                );
                TransitionOutcome::Failed { reason: e.to_string() }
            }
        }
    };
    TransitionRecord { name: v.name.clone(), version: v.version, from: v.stage, to, outcome }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieBreak;
    use crate::error::{PipelineError, PipelineResult};
    use crate::promotion::select_promotions;
    use crate::registry::{InMemoryRegistry, Metrics, Params, Run};

    /// Delegates to an in-memory registry but refuses stage changes for one
    /// name.
    struct FlakyRegistry {
        inner: InMemoryRegistry,
        refuse: &'static str,
    }

    impl ExperimentRegistry for FlakyRegistry {
        fn log_run(&self, e: &str, n: &str, m: &Metrics, p: &Params) -> PipelineResult<String> {
            self.inner.log_run(e, n, m, p)
        }
        fn get_all_runs(&self, e: &str) -> PipelineResult<Vec<Run>> {
            self.inner.get_all_runs(e)
        }
        fn register_model_version(&self, n: &str, r: Option<&str>, a: &str) -> PipelineResult<ModelVersion> {
            self.inner.register_model_version(n, r, a)
        }
        fn registered_names(&self) -> PipelineResult<Vec<String>> {
            self.inner.registered_names()
        }
        fn list_model_versions(&self, n: &str) -> PipelineResult<Vec<ModelVersion>> {
            self.inner.list_model_versions(n)
        }
        fn set_stage(&self, n: &str, v: u64, s: Stage) -> PipelineResult<()> {
            if n == self.refuse {
                return Err(PipelineError::RegistryUnavailable("connection reset".into()));
            }
            self.inner.set_stage(n, v, s)
        }
    }

    fn seeded(reg: &dyn ExperimentRegistry) -> PromotionDecision {
        for (name, score) in [("X0", 0.8), ("Y0", 0.75), ("X1", 0.6), ("Y1", 0.9)] {
            let mut m = Metrics::new();
            m.insert(format!("{}-best_score", name), score);
            let id = reg.log_run("exp", "train", &m, &Params::new()).unwrap();
            reg.register_model_version(name, Some(id.as_str()), "k").unwrap();
        }
        reg.register_model_version("KMeans", None, "k").unwrap();
        let runs = reg.get_all_runs("exp").unwrap();
        select_promotions(&runs, &reg.registered_names().unwrap(), 2, "KMeans", TieBreak::LowestKey)
    }

    fn stage_of(reg: &dyn ExperimentRegistry, name: &str) -> Stage {
        reg.latest_version(name).unwrap().unwrap().stage
    }

    #[test]
    fn winners_and_clustering_model_reach_production() {
        let reg = InMemoryRegistry::new();
        let decision = seeded(&reg);
        let records = apply(&decision, &reg.latest_versions().unwrap(), &reg);

        assert_eq!(records.len(), 5);
        assert!(records.iter().all(TransitionRecord::succeeded));
        assert_eq!(stage_of(&reg, "KMeans"), Stage::Production);
        assert_eq!(stage_of(&reg, "X0"), Stage::Production);
        assert_eq!(stage_of(&reg, "Y1"), Stage::Production);
        assert_eq!(stage_of(&reg, "Y0"), Stage::Staging);
        assert_eq!(stage_of(&reg, "X1"), Stage::Staging);
    }

    #[test]
    fn no_version_is_left_in_train() {
        let reg = InMemoryRegistry::new();
        let decision = seeded(&reg);
        apply(&decision, &reg.latest_versions().unwrap(), &reg);
        for v in reg.latest_versions().unwrap() {
            assert_ne!(v.stage, Stage::Train, "{} left in Train", v.name);
        }
    }

    #[test]
    fn reapplying_is_idempotent() {
        let reg = InMemoryRegistry::new();
        let decision = seeded(&reg);
        apply(&decision, &reg.latest_versions().unwrap(), &reg);
        let second = apply(&decision, &reg.latest_versions().unwrap(), &reg);
        assert!(second.iter().all(|r| r.outcome == TransitionOutcome::Unchanged));
    }

    #[test]
    fn demotion_moves_production_back_to_staging() {
        let reg = InMemoryRegistry::new();
        let decision = seeded(&reg);
        apply(&decision, &reg.latest_versions().unwrap(), &reg);

        let mut flipped = decision.clone();
        flipped.exclude(&[0]);
        let records = apply(&flipped, &reg.latest_versions().unwrap(), &reg);
        let x0 = records.iter().find(|r| r.name == "X0").unwrap();
        assert_eq!((x0.from, x0.to), (Stage::Production, Stage::Staging));
        assert_eq!(x0.outcome, TransitionOutcome::Applied);
        assert_eq!(stage_of(&reg, "X0"), Stage::Staging);
    }

    #[test]
    fn one_failure_does_not_block_the_rest() {
        let reg = FlakyRegistry { inner: InMemoryRegistry::new(), refuse: "X0" };
        let decision = seeded(&reg);
        let records = apply(&decision, &reg.latest_versions().unwrap(), &reg);

        let failed: Vec<&TransitionRecord> = records.iter().filter(|r| !r.succeeded()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "X0");
        assert!(matches!(&failed[0].outcome, TransitionOutcome::Failed { reason } if reason.contains("connection reset")));
        assert_eq!(stage_of(&reg, "Y1"), Stage::Production);
        assert_eq!(stage_of(&reg, "KMeans"), Stage::Production);
    }

    #[test]
    fn superseded_production_version_is_retired() {
        let reg = InMemoryRegistry::new();
        let decision = seeded(&reg);
        apply(&decision, &reg.latest_versions().unwrap(), &reg);
        // X0 v2 arrives and loses; v1 is still in Production.
        reg.register_model_version("X0", None, "k").unwrap();
        let mut flipped = decision.clone();
        flipped.exclude(&[0]);
        apply(&flipped, &reg.latest_versions().unwrap(), &reg);

        let records = retire_superseded(&reg.all_versions().unwrap(), &reg);
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].name.as_str(), records[0].version), ("X0", 1));
        assert_eq!((records[0].from, records[0].to), (Stage::Production, Stage::Staging));
        let stages: Vec<Stage> = reg.list_model_versions("X0").unwrap().iter().map(|v| v.stage).collect();
        assert!(!stages.contains(&Stage::Production));

        assert!(retire_superseded(&reg.all_versions().unwrap(), &reg).is_empty());
    }

    #[test]
    fn record_serialises_with_flat_outcome() {
        let rec = TransitionRecord {
            name: "X0".into(),
            version: 3,
            from: Stage::Train,
            to: Stage::Production,
            outcome: TransitionOutcome::Failed { reason: "down".into() },
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "down");
        assert_eq!(json["to"], "Production");
    }
}
