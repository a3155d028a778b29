//! Batch data model
//!
//! A [`BatchState`] is an ordered list of [`BatchSet`]s processed strictly in
//! order. Each set owns a persisted queue of [`WorkItem`]s and the
//! bookkeeping the worker needs to resume it in a later process:
//! remaining count, sandbox, results and elapsed time.
//!
//! # Invariants
//!
//! - `count` equals the number of items still in the set's queue
//! - `success` is true iff `count == 0` and the queue has been drained
//! - `current_set` only ever moves forward

pub mod definition;
pub mod progress;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::{BatchError, Result};

pub use definition::{BatchDefinition, SetDefinition};

/// Default message shown before the first item of a set runs
pub const DEFAULT_INIT_MESSAGE: &str = "Initializing.";

/// Default progress template
pub const DEFAULT_PROGRESS_MESSAGE: &str = "Completed @current of @total.";

/// Default message reported when a set fails
pub const DEFAULT_ERROR_MESSAGE: &str = "An error has occurred.";

/// A single unit of work: an operation identifier plus its arguments.
///
/// Immutable once enqueued. The operation name is resolved through the
/// [`OperationRegistry`](crate::operations::OperationRegistry) at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub operation: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl WorkItem {
    pub fn new(operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            operation: operation.into(),
            arguments,
        }
    }
}

/// A named group of work items sharing a progress counter and a finished callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSet {
    pub title: String,

    /// Original operations, in submission order. Never shrinks; the live
    /// queue is persisted separately under `queue`.
    pub operations: Vec<WorkItem>,

    /// Name of the persisted queue holding the pending items
    pub queue: String,

    /// Remaining unprocessed items
    pub count: usize,

    /// Item count at creation (percentage denominator)
    pub total: usize,

    /// Scratch space for the item currently in progress
    #[serde(default)]
    pub sandbox: Map<String, Value>,

    /// Values collected from executed items
    #[serde(default)]
    pub results: Vec<Value>,

    pub success: bool,

    /// Finished callback identifier, run once during teardown
    pub finished: Option<String>,

    pub init_message: String,
    pub progress_message: String,
    pub error_message: String,

    /// Auxiliary definitions file loaded before the set is processed
    pub file: Option<PathBuf>,

    /// Wall-clock start in fractional unix seconds
    pub start: Option<f64>,

    /// Milliseconds spent processing this set, across all invocations
    pub elapsed_ms: f64,
}

impl BatchSet {
    /// Build a set from its definition. `queue` names the queue that will
    /// hold the set's items.
    pub fn from_definition(definition: SetDefinition, queue: impl Into<String>) -> Self {
        let total = definition.operations.len();
        Self {
            title: definition.title,
            operations: definition.operations,
            queue: queue.into(),
            count: total,
            total,
            sandbox: Map::new(),
            results: Vec::new(),
            success: false,
            finished: definition.finished,
            init_message: definition
                .init_message
                .unwrap_or_else(|| DEFAULT_INIT_MESSAGE.to_string()),
            progress_message: definition
                .progress_message
                .unwrap_or_else(|| DEFAULT_PROGRESS_MESSAGE.to_string()),
            error_message: definition
                .error_message
                .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            file: definition.file,
            start: None,
            elapsed_ms: 0.0,
        }
    }

    /// Items processed so far
    pub fn processed(&self) -> usize {
        self.total.saturating_sub(self.count)
    }
}

/// Full persisted state of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    /// Assigned once at creation, stable across all resumptions
    pub id: u64,

    pub sets: Vec<BatchSet>,

    /// Cursor into `sets`
    pub current_set: usize,

    /// Whether this batch may span multiple invocations (always true here)
    pub progressive: bool,

    /// Set by the invocation entry point once a worker has picked the batch up
    #[serde(default)]
    pub running: bool,
}

impl BatchState {
    pub fn new(id: u64, sets: Vec<BatchSet>) -> Self {
        Self {
            id,
            sets,
            current_set: 0,
            progressive: true,
            running: false,
        }
    }

    /// Queue name for the set at `index` of batch `id`
    pub fn queue_name(id: u64, index: usize) -> String {
        format!("batch:{}:{}", id, index)
    }

    /// Fails if the cursor does not point at a set.
    pub fn check_cursor(&self) -> Result<()> {
        if self.current_set < self.sets.len() {
            Ok(())
        } else {
            Err(BatchError::state(format!(
                "batch {} cursor {} is out of range ({} sets)",
                self.id,
                self.current_set,
                self.sets.len()
            )))
        }
    }

    /// The set under the cursor. Callers must have run [`check_cursor`](Self::check_cursor).
    pub fn current(&self) -> &BatchSet {
        &self.sets[self.current_set]
    }

    pub fn current_mut(&mut self) -> &mut BatchSet {
        &mut self.sets[self.current_set]
    }

    /// Error message of the set under the cursor, or the default when the
    /// cursor is out of range
    pub fn error_message(&self) -> &str {
        self.sets
            .get(self.current_set)
            .map_or(DEFAULT_ERROR_MESSAGE, |set| set.error_message.as_str())
    }

    /// Move the cursor to the next set. Returns false when already at the last set.
    pub fn advance_set(&mut self) -> bool {
        if self.current_set + 1 < self.sets.len() {
            self.current_set += 1;
            true
        } else {
            false
        }
    }

    /// True once every set has succeeded
    pub fn is_complete(&self) -> bool {
        self.sets.iter().all(|set| set.success)
    }

    /// Items remaining across all sets
    pub fn remaining(&self) -> usize {
        self.sets.iter().map(|set| set.count).sum()
    }
}

/// Current time as fractional unix seconds
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
