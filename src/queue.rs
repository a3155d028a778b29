//! Work queues
//!
//! Each batch set has its own named queue. Items are claimed from the head
//! and stay there until explicitly deleted, so an item that reports partial
//! completion is claimed again by the next pass, in this process or the next.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::batch::{BatchSet, WorkItem};
use crate::error::{BatchError, Result};
use crate::store::write_atomic;

/// A claimed item together with its queue-assigned id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub item_id: u64,
    pub item: WorkItem,
}

/// Operations on a single named queue
pub trait WorkQueue {
    /// Make sure the queue exists (empty if new)
    fn create(&mut self) -> Result<()>;

    /// Append an item and return its id
    fn push(&mut self, item: WorkItem) -> Result<u64>;

    /// The head item, left in place until [`delete`](Self::delete)
    fn claim(&mut self) -> Result<Option<QueuedItem>>;

    fn delete(&mut self, item: &QueuedItem) -> Result<()>;

    /// Every pending item in queue order
    fn list_all(&self) -> Result<Vec<WorkItem>>;

    /// Remove the queue entirely
    fn destroy(&mut self) -> Result<()>;
}

/// Hands out queues by name
pub trait QueueProvider {
    fn queue(&self, name: &str) -> Result<Box<dyn WorkQueue + '_>>;

    /// The queue holding `set`'s items
    fn queue_for(&self, set: &BatchSet) -> Result<Box<dyn WorkQueue + '_>> {
        self.queue(&set.queue)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueContents {
    last_id: u64,
    items: Vec<QueuedItem>,
}

impl QueueContents {
    fn push(&mut self, item: WorkItem) -> u64 {
        self.last_id += 1;
        self.items.push(QueuedItem {
            item_id: self.last_id,
            item,
        });
        self.last_id
    }

    fn remove(&mut self, item_id: u64) {
        self.items.retain(|queued| queued.item_id != item_id);
    }
}

/// Queues stored as JSON files under `<root>/queues/`
#[derive(Debug, Clone)]
pub struct FileQueueProvider {
    dir: PathBuf,
}

impl FileQueueProvider {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("queues");
        fs::create_dir_all(&dir)
            .map_err(|e| BatchError::persistence(format!("cannot create {:?}: {}", dir, e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

impl QueueProvider for FileQueueProvider {
    fn queue(&self, name: &str) -> Result<Box<dyn WorkQueue + '_>> {
        Ok(Box::new(FileQueue {
            path: self.path_for(name),
        }))
    }
}

struct FileQueue {
    path: PathBuf,
}

impl FileQueue {
    fn read(&self) -> Result<Option<QueueContents>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                BatchError::persistence(format!("corrupt queue {:?}: {}", self.path, e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BatchError::persistence(format!(
                "cannot read queue {:?}: {}",
                self.path, e
            ))),
        }
    }

    fn write(&self, contents: &QueueContents) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec(contents)?)
    }
}

impl WorkQueue for FileQueue {
    fn create(&mut self) -> Result<()> {
        if self.read()?.is_none() {
            self.write(&QueueContents::default())?;
        }
        Ok(())
    }

    fn push(&mut self, item: WorkItem) -> Result<u64> {
        let mut contents = self.read()?.unwrap_or_default();
        let id = contents.push(item);
        self.write(&contents)?;
        Ok(id)
    }

    fn claim(&mut self) -> Result<Option<QueuedItem>> {
        Ok(self.read()?.and_then(|contents| contents.items.into_iter().next()))
    }

    fn delete(&mut self, item: &QueuedItem) -> Result<()> {
        if let Some(mut contents) = self.read()? {
            contents.remove(item.item_id);
            self.write(&contents)?;
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<WorkItem>> {
        Ok(self
            .read()?
            .map(|contents| contents.items.into_iter().map(|q| q.item).collect())
            .unwrap_or_default())
    }

    fn destroy(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BatchError::persistence(format!(
                "cannot remove queue {:?}: {}",
                self.path, e
            ))),
        }
    }
}

/// In-memory queues shared by everything holding the provider
#[derive(Debug, Default)]
pub struct MemoryQueueProvider {
    queues: Mutex<HashMap<String, QueueContents>>,
}

impl MemoryQueueProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a queue named `name` currently exists
    pub fn exists(&self, name: &str) -> bool {
        self.queues
            .lock()
            .map(|queues| queues.contains_key(name))
            .unwrap_or(false)
    }
}

impl QueueProvider for MemoryQueueProvider {
    fn queue(&self, name: &str) -> Result<Box<dyn WorkQueue + '_>> {
        Ok(Box::new(MemoryQueue {
            name: name.to_string(),
            queues: &self.queues,
        }))
    }
}

struct MemoryQueue<'a> {
    name: String,
    queues: &'a Mutex<HashMap<String, QueueContents>>,
}

impl MemoryQueue<'_> {
    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, QueueContents>) -> T) -> Result<T> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| BatchError::persistence("memory queue mutex poisoned"))?;
        Ok(f(&mut queues))
    }
}

impl WorkQueue for MemoryQueue<'_> {
    fn create(&mut self) -> Result<()> {
        self.with(|queues| {
            queues.entry(self.name.clone()).or_default();
        })
    }

    fn push(&mut self, item: WorkItem) -> Result<u64> {
        self.with(|queues| queues.entry(self.name.clone()).or_default().push(item))
    }

    fn claim(&mut self) -> Result<Option<QueuedItem>> {
        self.with(|queues| {
            queues
                .get(&self.name)
                .and_then(|contents| contents.items.first().cloned())
        })
    }

    fn delete(&mut self, item: &QueuedItem) -> Result<()> {
        self.with(|queues| {
            if let Some(contents) = queues.get_mut(&self.name) {
                contents.remove(item.item_id);
            }
        })
    }

    fn list_all(&self) -> Result<Vec<WorkItem>> {
        self.with(|queues| {
            queues
                .get(&self.name)
                .map(|contents| contents.items.iter().map(|q| q.item.clone()).collect())
                .unwrap_or_default()
        })
    }

    fn destroy(&mut self) -> Result<()> {
        self.with(|queues| {
            queues.remove(&self.name);
        })
    }
}
