//! Batch state persistence
//!
//! The store exclusively owns the durable copy of every [`BatchState`].
//! Exactly one worker invocation holds a mutable in-memory copy at a time;
//! the store performs no optimistic concurrency checks of its own.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::batch::BatchState;
use crate::error::{BatchError, Result};

/// Persistence for batch states, keyed by batch id.
pub trait BatchStore {
    /// Reserve a new id, unique across concurrent creations
    fn allocate_id(&self) -> Result<u64>;

    /// Persist a new batch. Fails if the id is already stored.
    fn create(&self, state: &BatchState) -> Result<()>;

    /// Load a batch, `None` if it does not exist
    fn load(&self, id: u64) -> Result<Option<BatchState>>;

    /// Overwrite an existing batch. Fails with `NotFound` if it was deleted.
    fn update(&self, state: &BatchState) -> Result<()>;

    /// Remove a batch. Deleting a missing batch is not an error.
    fn delete(&self, id: u64) -> Result<()>;
}

/// JSON files under a state directory:
///
/// ```text
/// <root>/batches/<id>.json   persisted state
/// <root>/ids/<id>            id reservations (never removed)
/// ```
#[derive(Debug, Clone)]
pub struct FileBatchStore {
    batches: PathBuf,
    ids: PathBuf,
}

impl FileBatchStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            batches: root.join("batches"),
            ids: root.join("ids"),
        };
        fs::create_dir_all(&store.batches).map_err(|e| {
            BatchError::persistence(format!("cannot create {:?}: {}", store.batches, e))
        })?;
        fs::create_dir_all(&store.ids).map_err(|e| {
            BatchError::persistence(format!("cannot create {:?}: {}", store.ids, e))
        })?;
        Ok(store)
    }

    fn state_path(&self, id: u64) -> PathBuf {
        self.batches.join(format!("{}.json", id))
    }

    fn highest_reserved_id(&self) -> Result<u64> {
        let entries = fs::read_dir(&self.ids)
            .map_err(|e| BatchError::persistence(format!("cannot list {:?}: {}", self.ids, e)))?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    fn write(&self, state: &BatchState) -> Result<()> {
        let path = self.state_path(state.id);
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &json)
    }
}

/// Write to a sibling temp file, then rename over the target so a crash
/// never leaves a truncated state file behind.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| BatchError::persistence(format!("cannot write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| BatchError::persistence(format!("cannot replace {:?}: {}", path, e)))
}

impl BatchStore for FileBatchStore {
    fn allocate_id(&self) -> Result<u64> {
        let mut candidate = self.highest_reserved_id()? + 1;
        loop {
            // create_new is atomic: exactly one allocator wins each id
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.ids.join(candidate.to_string()))
            {
                Ok(_) => {
                    debug!("Allocated batch id {}", candidate);
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => {
                    return Err(BatchError::persistence(format!(
                        "cannot reserve batch id {}: {}",
                        candidate, e
                    )));
                }
            }
        }
    }

    fn create(&self, state: &BatchState) -> Result<()> {
        if self.state_path(state.id).exists() {
            return Err(BatchError::persistence(format!(
                "batch {} already exists",
                state.id
            )));
        }
        self.write(state)
    }

    fn load(&self, id: u64) -> Result<Option<BatchState>> {
        let path = self.state_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BatchError::persistence(format!("cannot read {:?}: {}", path, e)));
            }
        };
        let state = serde_json::from_str(&content)
            .map_err(|e| BatchError::persistence(format!("corrupt state {:?}: {}", path, e)))?;
        Ok(Some(state))
    }

    fn update(&self, state: &BatchState) -> Result<()> {
        if !self.state_path(state.id).exists() {
            return Err(BatchError::NotFound(state.id));
        }
        self.write(state)
    }

    fn delete(&self, id: u64) -> Result<()> {
        match fs::remove_file(self.state_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BatchError::persistence(format!(
                "cannot delete batch {}: {}",
                id, e
            ))),
        }
    }
}

/// In-memory store for tests and single-process runs
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    last_id: u64,
    states: BTreeMap<u64, BatchState>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.states.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryStoreInner>> {
        self.inner
            .lock()
            .map_err(|_| BatchError::persistence("memory store mutex poisoned"))
    }
}

impl BatchStore for MemoryBatchStore {
    fn allocate_id(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.last_id += 1;
        Ok(inner.last_id)
    }

    fn create(&self, state: &BatchState) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.states.contains_key(&state.id) {
            return Err(BatchError::persistence(format!(
                "batch {} already exists",
                state.id
            )));
        }
        inner.states.insert(state.id, state.clone());
        Ok(())
    }

    fn load(&self, id: u64) -> Result<Option<BatchState>> {
        Ok(self.lock()?.states.get(&id).cloned())
    }

    fn update(&self, state: &BatchState) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.states.get_mut(&state.id) {
            Some(stored) => {
                *stored = state.clone();
                Ok(())
            }
            None => Err(BatchError::NotFound(state.id)),
        }
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.lock()?.states.remove(&id);
        Ok(())
    }
}
