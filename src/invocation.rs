//! Invocation entry point
//!
//! One call to [`process_batch`] is one worker invocation: load the batch,
//! run the worker, write the state back, and tear the batch down once the
//! worker reports completion. The returned [`BatchReport`] is what a
//! `process` subprocess prints for its driver.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::batch::BatchState;
use crate::error::{BatchError, Result};
use crate::runtime::BatchRuntime;
use crate::store::BatchStore;
use crate::teardown::{TeardownSummary, finish_batch};
use crate::worker::run_worker;

/// Writes the batch state back to the store when dropped.
///
/// The normal path calls [`commit`](Self::commit) so a failed write reaches
/// the caller. Early returns and panics fall through to `Drop`, which can
/// only log.
pub struct PersistGuard<'a> {
    store: &'a dyn BatchStore,
    state: BatchState,
    armed: bool,
}

impl<'a> PersistGuard<'a> {
    pub fn new(store: &'a dyn BatchStore, state: BatchState) -> Self {
        Self {
            store,
            state,
            armed: true,
        }
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BatchState {
        &mut self.state
    }

    /// Persist now and disarm
    pub fn commit(mut self) -> Result<()> {
        self.armed = false;
        self.store.update(&self.state)
    }
}

impl Drop for PersistGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Persisting batch {} on early exit", self.state.id);
        if let Err(e) = self.store.update(&self.state) {
            error!("Failed to persist batch {}: {}", self.state.id, e);
        }
    }
}

/// Result of one worker invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub id: u64,
    #[serde(rename = "batch_process_finished")]
    pub finished: bool,
    pub percentage: String,
    pub message: String,
    #[serde(default)]
    pub task_message: String,
    #[serde(default)]
    pub items_completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownSummary>,
}

impl BatchReport {
    /// The report as a JSON object, the shape spawners hand back to the driver
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(BatchError::state(format!(
                "report serialized to a non-object: {}",
                other
            ))),
        }
    }
}

/// Bring each unfinished set's `count` back in line with its queue.
///
/// Items are deleted from the queue as they complete, but the state is only
/// written when the invocation ends. A worker killed in between leaves the
/// queue shorter than the stored count; the queue wins. Returns the number of
/// sets that were corrected.
pub fn reconcile_counts(state: &mut BatchState, rt: &BatchRuntime<'_>) -> Result<usize> {
    let id = state.id;
    let mut corrected = 0;
    for (index, set) in state.sets.iter_mut().enumerate().skip(state.current_set) {
        if set.success {
            continue;
        }
        let pending = rt.queues.queue_for(set)?.list_all()?.len();
        if pending != set.count {
            warn!(
                "Batch {} set {}: state expects {} item(s) but queue '{}' holds {}, \
                 progress from an interrupted invocation was lost",
                id, index, set.count, set.queue, pending
            );
            set.count = pending;
            corrected += 1;
        }
    }
    Ok(corrected)
}

/// Run one worker invocation against batch `id`.
pub fn process_batch(id: u64, rt: &BatchRuntime<'_>) -> Result<BatchReport> {
    let mut state = rt.store.load(id)?.ok_or(BatchError::NotFound(id))?;
    state.running = true;
    reconcile_counts(&mut state, rt)?;

    let mut guard = PersistGuard::new(rt.store, state);
    let pass = match run_worker(guard.state_mut(), rt) {
        Ok(pass) => pass,
        Err(e) => {
            let message = guard.state().error_message().to_string();
            error!("Batch {}: {} {}", id, message, e);
            return Err(BatchError::aborted(message, e));
        }
    };
    guard.commit()?;

    let teardown = if pass.finished {
        finish_batch(id, rt)?
    } else {
        None
    };

    Ok(BatchReport {
        id,
        finished: pass.finished,
        percentage: pass.percentage,
        message: pass.message,
        task_message: pass.task_message,
        items_completed: pass.items_completed,
        teardown,
    })
}
