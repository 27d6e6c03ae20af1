//! # Stage: Artifact Store & Data Source
//!
//! ## Responsibility
//! The single storage seam shared by every stage.  [`ArtifactStore`] moves
//! opaque byte blobs by key; [`DataSource`] moves whole [`Dataset`] tables.
//! Both are implemented once and injected, never re-implemented per stage.
//!
//! ## Guarantees
//! - Keys are opaque `/`-separated strings; `list(prefix)` returns them sorted
//! - Non-panicking: all failures surface as `PipelineError::StoreUnavailable`
//! - Thread-safe: implementations are `Send + Sync` so per-cluster workers
//!   can write their own keys concurrently
//!
//! ## NOT Responsible For
//! - Retries, timeouts, or transport (collaborator wrapper's concern)
//! - CSV or any other wire format for tables (JSON only here)

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dataset::Dataset;
use crate::error::{PipelineError, PipelineResult};

// ---------------------------------------------------------------------------
// ArtifactStore trait
// ---------------------------------------------------------------------------

/// Byte-blob persistence by key.
pub trait ArtifactStore: Send + Sync {
    /// Fetch the blob at `key`.
    ///
    /// # Errors
    /// `StoreUnavailable` when the key is absent or the backend fails.
    fn get(&self, key: &str) -> PipelineResult<Vec<u8>>;

    /// Store `bytes` at `key`, replacing any previous blob.
    fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()>;

    /// All keys starting with `prefix`, ascending.
    fn list(&self, prefix: &str) -> PipelineResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// InMemoryArtifactStore
// ---------------------------------------------------------------------------

/// An `ArtifactStore` held entirely in memory.
///
/// Used by tests and by dry runs where nothing should touch disk.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs (0 if the mutex is poisoned).
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> PipelineError {
    PipelineError::StoreUnavailable("internal mutex poisoned".into())
}

impl ArtifactStore for InMemoryArtifactStore {
    fn get(&self, key: &str) -> PipelineResult<Vec<u8>> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::StoreUnavailable(format!("no artifact at '{}'", key)))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()> {
        let mut blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        Ok(blobs.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// An `ArtifactStore` rooted at a local directory; key `a/b.json` lives at
/// `<root>/a/b.json`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root.  Absolute keys and `..`
    /// components are rejected.
    fn path_for(&self, key: &str) -> PipelineResult<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(PipelineError::StoreUnavailable(format!("invalid artifact key '{}'", key)));
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key: Vec<String> =
                    rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

fn io_err(key: &str, e: std::io::Error) -> PipelineError {
    PipelineError::StoreUnavailable(format!("'{}': {}", key, e))
}

impl ArtifactStore for FsArtifactStore {
    fn get(&self, key: &str) -> PipelineResult<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| io_err(key, e))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(key, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| io_err(key, e))
    }

    fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(&self.root, &mut keys).map_err(|e| io_err(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// DataSource
// ---------------------------------------------------------------------------

/// Table-level reads and writes.
pub trait DataSource: Send + Sync {
    fn read_table(&self, key: &str) -> PipelineResult<Dataset>;

    fn write_table(&self, dataset: &Dataset, key: &str) -> PipelineResult<()>;
}

/// A `DataSource` that keeps each table as one JSON blob in an
/// [`ArtifactStore`], so tables and models share a single store.
pub struct StoreTableSource {
    store: Arc<dyn ArtifactStore>,
}

impl StoreTableSource {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

impl DataSource for StoreTableSource {
    fn read_table(&self, key: &str) -> PipelineResult<Dataset> {
        let bytes = self.store.get(key)?;
        let dataset: Dataset = serde_json::from_slice(&bytes)?;
        dataset.validated()
    }

    fn write_table(&self, dataset: &Dataset, key: &str) -> PipelineResult<()> {
        self.store.put(key, &serde_json::to_vec(dataset)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
