//! # Stage: Experiment Registry
//!
//! ## Responsibility
//! Records training runs (metrics + params per run) and named model versions
//! with a lifecycle [`Stage`].  The promotion selector reads the full run
//! history from here; the transition applier changes stages here.
//!
//! Two backends share the [`ExperimentRegistry`] trait:
//! - [`InMemoryRegistry`] — tests and dry runs
//! - [`SqliteRegistry`]   — durable single-file registry (`rusqlite`)
//!
//! ## Guarantees
//! - Runs are append-only; nothing here mutates or deletes a run
//! - Versions per name increase monotonically from 1
//! - Stage changes obey `Train → {Staging, Production}`, `Staging ↔ Production`;
//!   a move back to `Train` is refused with `InvalidTransition`
//! - Thread-safe: both backends are `Send + Sync`
//!
//! ## NOT Responsible For
//! - Deciding which version deserves which stage (see `promotion`, `transition`)
//! - Retry or transport policy for remote registries

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Lifecycle label of a registered model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Freshly registered by the trainer, not yet evaluated for promotion.
    Train,
    Staging,
    Production,
}

impl Stage {
    /// Whether the lifecycle permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: Stage) -> bool {
        !(to == Stage::Train && self != Stage::Train)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Train => write!(f, "Train"),
            Stage::Staging => write!(f, "Staging"),
            Stage::Production => write!(f, "Production"),
        }
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Train" => Ok(Stage::Train),
            "Staging" => Ok(Stage::Staging),
            "Production" => Ok(Stage::Production),
            other => Err(PipelineError::RegistryUnavailable(format!("unknown stage '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Metric values of one run, keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// Free-form run parameters.
pub type Params = BTreeMap<String, serde_json::Value>;

/// One recorded training attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub experiment: String,
    pub run_name: String,
    pub metrics: Metrics,
    pub params: Params,
}

/// One version of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub stage: Stage,
    /// Run that produced this version, if any.
    pub run_id: Option<String>,
    /// Artifact-store key of the serialised model.
    pub artifact_key: String,
}

// ---------------------------------------------------------------------------
// ExperimentRegistry trait
// ---------------------------------------------------------------------------

/// Run history and model-version lifecycle.
pub trait ExperimentRegistry: Send + Sync {
    /// Append a run; returns its generated run id.
    fn log_run(
        &self,
        experiment: &str,
        run_name: &str,
        metrics: &Metrics,
        params: &Params,
    ) -> PipelineResult<String>;

    /// Every run ever logged for `experiment`, in logging order.
    fn get_all_runs(&self, experiment: &str) -> PipelineResult<Vec<Run>>;

    /// Create the next version of `name` in stage `Train`.
    fn register_model_version(
        &self,
        name: &str,
        run_id: Option<&str>,
        artifact_key: &str,
    ) -> PipelineResult<ModelVersion>;

    /// Names of all registered models, ascending.
    fn registered_names(&self) -> PipelineResult<Vec<String>>;

    /// All versions of `name`, ascending by version.
    fn list_model_versions(&self, name: &str) -> PipelineResult<Vec<ModelVersion>>;

    /// Change the stage of one version.
    ///
    /// # Errors
    /// `InvalidTransition` for a move back to `Train`; `RegistryUnavailable`
    /// for an unknown version or a backend failure.
    fn set_stage(&self, name: &str, version: u64, stage: Stage) -> PipelineResult<()>;

    /// Highest version of `name`, if any.
    fn latest_version(&self, name: &str) -> PipelineResult<Option<ModelVersion>> {
        Ok(self.list_model_versions(name)?.into_iter().max_by_key(|v| v.version))
    }

    /// Latest version of every registered model.
    fn latest_versions(&self) -> PipelineResult<Vec<ModelVersion>> {
        let mut out = Vec::new();
        for name in self.registered_names()? {
            if let Some(v) = self.latest_version(&name)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Every version of every registered model.
    fn all_versions(&self) -> PipelineResult<Vec<ModelVersion>> {
        let mut out = Vec::new();
        for name in self.registered_names()? {
            out.extend(self.list_model_versions(&name)?);
        }
        Ok(out)
    }
}

fn check_transition(current: &ModelVersion, to: Stage) -> PipelineResult<()> {
    if current.stage.can_transition_to(to) {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition {
            name: current.name.clone(),
            version: current.version,
            from: current.stage.to_string(),
            to: to.to_string(),
        })
    }
}

fn unknown_version(name: &str, version: u64) -> PipelineError {
    PipelineError::RegistryUnavailable(format!("no version {} of model '{}'", version, name))
}

// ---------------------------------------------------------------------------
// InMemoryRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    runs: Vec<Run>,
    versions: BTreeMap<String, Vec<ModelVersion>>,
}

/// An `ExperimentRegistry` held in memory.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<MemoryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::RegistryUnavailable("internal mutex poisoned".into()))
    }
}

impl ExperimentRegistry for InMemoryRegistry {
    fn log_run(
        &self,
        experiment: &str,
        run_name: &str,
        metrics: &Metrics,
        params: &Params,
    ) -> PipelineResult<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.lock()?.runs.push(Run {
            run_id: run_id.clone(),
            experiment: experiment.to_string(),
            run_name: run_name.to_string(),
            metrics: metrics.clone(),
            params: params.clone(),
        });
        Ok(run_id)
    }

    fn get_all_runs(&self, experiment: &str) -> PipelineResult<Vec<Run>> {
        Ok(self.lock()?.runs.iter().filter(|r| r.experiment == experiment).cloned().collect())
    }

    fn register_model_version(
        &self,
        name: &str,
        run_id: Option<&str>,
        artifact_key: &str,
    ) -> PipelineResult<ModelVersion> {
        let mut state = self.lock()?;
        let versions = state.versions.entry(name.to_string()).or_default();
        let version = versions.last().map_or(1, |v| v.version + 1);
        let mv = ModelVersion {
            name: name.to_string(),
            version,
            stage: Stage::Train,
            run_id: run_id.map(str::to_string),
            artifact_key: artifact_key.to_string(),
        };
        versions.push(mv.clone());
        Ok(mv)
    }

    fn registered_names(&self) -> PipelineResult<Vec<String>> {
        Ok(self.lock()?.versions.keys().cloned().collect())
    }

    fn list_model_versions(&self, name: &str) -> PipelineResult<Vec<ModelVersion>> {
        Ok(self.lock()?.versions.get(name).cloned().unwrap_or_default())
    }

    fn set_stage(&self, name: &str, version: u64, stage: Stage) -> PipelineResult<()> {
        let mut state = self.lock()?;
        let mv = state
            .versions
            .get_mut(name)
            .and_then(|vs| vs.iter_mut().find(|v| v.version == version))
            .ok_or_else(|| unknown_version(name, version))?;
        check_transition(mv, stage)?;
        mv.stage = stage;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SqliteRegistry
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL UNIQUE,
    experiment TEXT NOT NULL,
    run_name   TEXT NOT NULL,
    metrics    TEXT NOT NULL,
    params     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS runs_by_experiment ON runs (experiment);
CREATE TABLE IF NOT EXISTS model_versions (
    name         TEXT NOT NULL,
    version      INTEGER NOT NULL,
    stage        TEXT NOT NULL,
    run_id       TEXT,
    artifact_key TEXT NOT NULL,
    PRIMARY KEY (name, version)
);
";

/// An `ExperimentRegistry` persisted in a single SQLite file.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (creating if needed) the registry at `path`.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database (for testing).
    pub fn open_in_memory() -> PipelineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> PipelineResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> PipelineResult<T>) -> PipelineResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| PipelineError::RegistryUnavailable("internal mutex poisoned".into()))?;
        f(&conn)
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, u64, String, Option<String>, String)> {
    Ok((row.get(0)?, row.get::<_, i64>(1)? as u64, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn version_from_parts(
    (name, version, stage, run_id, artifact_key): (String, u64, String, Option<String>, String),
) -> PipelineResult<ModelVersion> {
    Ok(ModelVersion { name, version, stage: stage.parse()?, run_id, artifact_key })
}

impl ExperimentRegistry for SqliteRegistry {
    fn log_run(
        &self,
        experiment: &str,
        run_name: &str,
        metrics: &Metrics,
        params: &Params,
    ) -> PipelineResult<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let metrics = serde_json::to_string(metrics)?;
        let params_json = serde_json::to_string(params)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, experiment, run_name, metrics, params) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, experiment, run_name, metrics, params_json],
            )?;
            Ok(())
        })?;
        Ok(run_id)
    }

    fn get_all_runs(&self, experiment: &str) -> PipelineResult<Vec<Run>> {
        let raw: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, run_name, metrics, params FROM runs WHERE experiment = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![experiment], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter()
            .map(|(run_id, run_name, metrics, params)| {
                Ok(Run {
                    run_id,
                    experiment: experiment.to_string(),
                    run_name,
                    metrics: serde_json::from_str(&metrics)?,
                    params: serde_json::from_str(&params)?,
                })
            })
            .collect()
    }

    fn register_model_version(
        &self,
        name: &str,
        run_id: Option<&str>,
        artifact_key: &str,
    ) -> PipelineResult<ModelVersion> {
        self.with_conn(|conn| {
            let current: Option<i64> = conn.query_row(
                "SELECT MAX(version) FROM model_versions WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )?;
            let version = current.unwrap_or(0) as u64 + 1;
            conn.execute(
                "INSERT INTO model_versions (name, version, stage, run_id, artifact_key) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, version as i64, Stage::Train.to_string(), run_id, artifact_key],
            )?;
            Ok(ModelVersion {
                name: name.to_string(),
                version,
                stage: Stage::Train,
                run_id: run_id.map(str::to_string),
                artifact_key: artifact_key.to_string(),
            })
        })
    }

    fn registered_names(&self) -> PipelineResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT name FROM model_versions ORDER BY name")?;
            let names = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    fn list_model_versions(&self, name: &str) -> PipelineResult<Vec<ModelVersion>> {
        let raw = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, version, stage, run_id, artifact_key FROM model_versions
                 WHERE name = ?1 ORDER BY version",
            )?;
            let rows = stmt.query_map(params![name], row_to_version)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(version_from_parts).collect()
    }

    fn set_stage(&self, name: &str, version: u64, stage: Stage) -> PipelineResult<()> {
        self.with_conn(|conn| {
            let current = conn
                .query_row(
                    "SELECT name, version, stage, run_id, artifact_key FROM model_versions
                     WHERE name = ?1 AND version = ?2",
                    params![name, version as i64],
                    row_to_version,
                )
                .optional()?
                .ok_or_else(|| unknown_version(name, version))?;
            check_transition(&version_from_parts(current)?, stage)?;
            conn.execute(
                "UPDATE model_versions SET stage = ?1 WHERE name = ?2 AND version = ?3",
                params![stage.to_string(), name, version as i64],
            )?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
