//! Completion teardown
//!
//! Runs every set's finished callback, removes the persisted state and
//! destroys the queues. A second call for the same id finds nothing and
//! does nothing.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::operations::FinishedArgs;
use crate::runtime::BatchRuntime;

/// What a teardown did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeardownSummary {
    pub id: u64,
    /// Finished callbacks that returned `Ok`
    pub callbacks_run: usize,
    /// One message per callback that returned an error
    #[serde(default)]
    pub callback_failures: Vec<String>,
    pub queues_destroyed: usize,
}

/// Tear down batch `id`. Returns `None` if the batch no longer exists.
pub fn finish_batch(id: u64, rt: &BatchRuntime<'_>) -> Result<Option<TeardownSummary>> {
    let Some(state) = rt.store.load(id)? else {
        debug!("Batch {} already torn down", id);
        return Ok(None);
    };

    let mut summary = TeardownSummary {
        id,
        ..TeardownSummary::default()
    };

    for (index, set) in state.sets.iter().enumerate() {
        let Some(callback) = &set.finished else {
            continue;
        };
        let args = FinishedArgs {
            success: set.success,
            results: &set.results,
            operations: &set.operations,
            elapsed: Duration::from_secs_f64(set.elapsed_ms.max(0.0) / 1000.0),
        };
        match rt.registry.run_finished(callback, args) {
            Ok(()) => summary.callbacks_run += 1,
            Err(e) => {
                warn!(
                    "Batch {} set {}: finished callback '{}' failed: {:#}",
                    id, index, callback, e
                );
                summary
                    .callback_failures
                    .push(format!("set {}: {}: {:#}", index, callback, e));
            }
        }
    }

    rt.store.delete(id)?;

    for (index, set) in state.sets.iter().enumerate() {
        let mut queue = rt.queues.queue_for(set)?;
        let leftover = queue.list_all()?.len();
        if leftover > 0 {
            warn!(
                "Batch {} set {}: discarding {} unprocessed item(s) from '{}'",
                id, index, leftover, set.queue
            );
        }
        queue.destroy()?;
        summary.queues_destroyed += 1;
    }

    info!(
        "Batch {} finished: {} callback(s) run, {} failed",
        id,
        summary.callbacks_run,
        summary.callback_failures.len()
    );

    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchDefinition, SetDefinition, WorkItem};
    use crate::driver::submit;
    use crate::memory::FixedMemoryProbe;
    use crate::operations::OperationRegistry;
    use crate::queue::MemoryQueueProvider;
    use crate::store::{BatchStore, MemoryBatchStore};
    use crate::worker::run_worker;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn two_sets(callback: &str) -> BatchDefinition {
        let set = |n: usize| SetDefinition {
            operations: (0..n).map(|i| WorkItem::new("echo", vec![json!(i)])).collect(),
            finished: Some(callback.to_string()),
            ..SetDefinition::default()
        };
        BatchDefinition {
            sets: vec![set(2), set(1)],
        }
    }

    #[test]
    fn test_callbacks_run_in_set_order_with_original_operations() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::with_builtins();
        {
            let calls = Arc::clone(&calls);
            registry.register_finished("record", move |args| {
                calls.lock().expect("lock").push((
                    args.success,
                    args.results.len(),
                    args.operations.len(),
                ));
                Ok(())
            });
        }
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let memory = FixedMemoryProbe::unlimited();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);

        let mut state = submit(two_sets("record"), &rt).expect("submit");
        assert!(run_worker(&mut state, &rt).expect("worker").finished);
        store.update(&state).expect("persist");

        let summary = finish_batch(state.id, &rt).expect("teardown").expect("summary");
        assert_eq!(summary.callbacks_run, 2);
        assert_eq!(summary.queues_destroyed, 2);
        assert_eq!(*calls.lock().expect("lock"), vec![(true, 2, 2), (true, 1, 1)]);
        assert!(!store.contains(state.id));
        assert!(!queues.exists(&state.sets[0].queue));
        assert!(!queues.exists(&state.sets[1].queue));
    }

    #[test]
    fn test_second_teardown_is_a_noop() {
        let calls = Arc::new(Mutex::new(0));
        let mut registry = OperationRegistry::with_builtins();
        {
            let calls = Arc::clone(&calls);
            registry.register_finished("count_calls", move |_args| {
                *calls.lock().expect("lock") += 1;
                Ok(())
            });
        }
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let memory = FixedMemoryProbe::unlimited();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);
        let state = submit(two_sets("count_calls"), &rt).expect("submit");

        assert!(finish_batch(state.id, &rt).expect("first").is_some());
        assert!(finish_batch(state.id, &rt).expect("second").is_none());
        assert_eq!(*calls.lock().expect("lock"), 2);
    }

    #[test]
    fn test_failing_callback_does_not_stop_teardown() {
        let mut registry = OperationRegistry::with_builtins();
        registry.register_finished("explode", |_args| anyhow::bail!("callback broke"));
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let memory = FixedMemoryProbe::unlimited();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);
        let state = submit(two_sets("explode"), &rt).expect("submit");

        let summary = finish_batch(state.id, &rt).expect("teardown").expect("summary");
        assert_eq!(summary.callbacks_run, 0);
        assert_eq!(summary.callback_failures.len(), 2);
        assert!(summary.callback_failures[0].contains("callback broke"));
        assert!(!store.contains(state.id));
    }
}
