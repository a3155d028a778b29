//! Process driver
//!
//! Submits a batch and then keeps starting worker invocations against it
//! until one of them reports `batch_process_finished`. Each invocation is
//! expected to make some progress and exit, typically because it ran into
//! the memory budget; the driver just starts the next one.

use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::batch::{BatchDefinition, BatchSet, BatchState};
use crate::error::{BatchError, Result};
use crate::runtime::BatchRuntime;

/// Subcommand a worker invocation runs
pub const PROCESS_COMMAND: &str = "process";

/// Key in a worker's result that signals the batch is done
pub const FINISHED_KEY: &str = "batch_process_finished";

/// Ambient context forwarded to every spawned invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnContext {
    /// Identity the invocation runs as
    pub actor: Option<String>,
}

/// What a spawned invocation handed back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOutcome {
    /// Set when the invocation failed
    pub error: Option<String>,
    /// Structured result, `None` if the invocation produced nothing usable
    pub result: Option<Map<String, Value>>,
}

impl SpawnOutcome {
    pub fn success(result: Map<String, Value>) -> Self {
        Self {
            error: None,
            result: Some(result),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            result: None,
        }
    }
}

/// Runs one worker invocation, in a new process or in this one.
pub trait ExecutionSpawner {
    fn spawn(&self, command: &str, args: &[String], context: &SpawnContext) -> SpawnOutcome;
}

/// Result of driving a batch to completion
#[derive(Debug, Clone, PartialEq)]
pub struct DriveSummary {
    pub id: u64,
    /// Worker invocations started, including the finishing one
    pub invocations: usize,
    /// Result of the final invocation
    pub result: Map<String, Value>,
}

/// Validate and persist a new batch, filling one queue per set.
pub fn submit(definition: BatchDefinition, rt: &BatchRuntime<'_>) -> Result<BatchState> {
    definition.validate(rt.registry)?;

    let id = rt.store.allocate_id()?;
    let mut sets = Vec::with_capacity(definition.sets.len());

    for (index, set) in definition.sets.into_iter().enumerate() {
        let name = BatchState::queue_name(id, index);
        let mut queue = rt.queues.queue(&name)?;
        queue.create()?;
        for item in &set.operations {
            queue.push(item.clone())?;
        }
        debug!("Queued {} item(s) in '{}'", set.operations.len(), name);
        sets.push(BatchSet::from_definition(set, name));
    }

    let state = BatchState::new(id, sets);
    rt.store.create(&state)?;

    info!(
        "Submitted batch {} with {} set(s), {} item(s)",
        id,
        state.sets.len(),
        state.remaining()
    );
    Ok(state)
}

/// Start worker invocations for batch `id` until one reports completion.
///
/// There is no delay between invocations and no retry: a failed or empty
/// invocation ends the loop and leaves the batch persisted for inspection.
pub fn drive(
    id: u64,
    spawner: &dyn ExecutionSpawner,
    context: &SpawnContext,
) -> Result<DriveSummary> {
    let args = vec![id.to_string()];
    let mut invocations = 0;

    loop {
        invocations += 1;
        debug!("Batch {}: starting worker invocation {}", id, invocations);

        let outcome = spawner.spawn(PROCESS_COMMAND, &args, context);

        if let Some(message) = outcome.error {
            error!("Batch {}: invocation {} failed: {}", id, invocations, message);
            return Err(BatchError::spawn(invocations, message));
        }

        let result = match outcome.result {
            Some(result) if !result.is_empty() => result,
            _ => {
                error!("Batch {}: invocation {} returned nothing", id, invocations);
                return Err(BatchError::EmptyResult { invocation: invocations });
            }
        };

        if result.get(FINISHED_KEY).and_then(Value::as_bool).unwrap_or(false) {
            info!("Batch {} completed after {} invocation(s)", id, invocations);
            return Ok(DriveSummary {
                id,
                invocations,
                result,
            });
        }
    }
}

/// Submit `definition` and drive it to completion.
pub fn backend_batch_process(
    definition: BatchDefinition,
    rt: &BatchRuntime<'_>,
    spawner: &dyn ExecutionSpawner,
    context: &SpawnContext,
) -> Result<DriveSummary> {
    let state = submit(definition, rt)?;
    drive(state.id, spawner, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{SetDefinition, WorkItem};
    use crate::memory::FixedMemoryProbe;
    use crate::operations::OperationRegistry;
    use crate::queue::{MemoryQueueProvider, QueueProvider};
    use crate::store::{BatchStore, MemoryBatchStore};
    use serde_json::json;
    use std::cell::RefCell;

    /// Replays a scripted sequence of outcomes
    struct ScriptedSpawner {
        outcomes: RefCell<Vec<SpawnOutcome>>,
        calls: RefCell<Vec<(String, Vec<String>, SpawnContext)>>,
    }

    impl ScriptedSpawner {
        fn new(mut outcomes: Vec<SpawnOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: RefCell::new(outcomes),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ExecutionSpawner for ScriptedSpawner {
        fn spawn(&self, command: &str, args: &[String], context: &SpawnContext) -> SpawnOutcome {
            self.calls
                .borrow_mut()
                .push((command.to_string(), args.to_vec(), context.clone()));
            self.outcomes
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| SpawnOutcome::failure("script exhausted"))
        }
    }

    fn report(finished: bool) -> SpawnOutcome {
        let mut map = Map::new();
        map.insert(FINISHED_KEY.into(), json!(finished));
        SpawnOutcome::success(map)
    }

    #[test]
    fn test_drive_loops_until_finished() {
        let spawner = ScriptedSpawner::new(vec![report(false), report(false), report(true)]);
        let context = SpawnContext {
            actor: Some("admin".into()),
        };

        let summary = drive(7, &spawner, &context).expect("drive");

        assert_eq!(summary.invocations, 3);
        let calls = spawner.calls.borrow();
        assert_eq!(calls.len(), 3);
        for (command, args, ctx) in calls.iter() {
            assert_eq!(command, PROCESS_COMMAND);
            assert_eq!(args, &vec!["7".to_string()]);
            assert_eq!(ctx, &context);
        }
    }

    #[test]
    fn test_drive_stops_on_error() {
        let spawner = ScriptedSpawner::new(vec![report(false), SpawnOutcome::failure("exit 255")]);
        let err = drive(1, &spawner, &SpawnContext::default()).unwrap_err();
        match err {
            BatchError::Spawn {
                invocation,
                message,
            } => {
                assert_eq!(invocation, 2);
                assert_eq!(message, "exit 255");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_drive_stops_on_empty_result() {
        let spawner = ScriptedSpawner::new(vec![SpawnOutcome::default()]);
        assert!(matches!(
            drive(1, &spawner, &SpawnContext::default()),
            Err(BatchError::EmptyResult { invocation: 1 })
        ));

        let spawner = ScriptedSpawner::new(vec![SpawnOutcome::success(Map::new())]);
        assert!(matches!(
            drive(1, &spawner, &SpawnContext::default()),
            Err(BatchError::EmptyResult { invocation: 1 })
        ));
    }

    #[test]
    fn test_submit_fills_one_queue_per_set() {
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let registry = OperationRegistry::with_builtins();
        let memory = FixedMemoryProbe::unlimited();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);

        let definition = BatchDefinition {
            sets: vec![
                SetDefinition {
                    operations: vec![
                        WorkItem::new("echo", vec![json!("a")]),
                        WorkItem::new("echo", vec![json!("b")]),
                    ],
                    ..SetDefinition::default()
                },
                SetDefinition::default(),
            ],
        };
        let state = submit(definition, &rt).expect("submit");

        assert_eq!(state.sets[0].queue, BatchState::queue_name(state.id, 0));
        assert_eq!(state.sets[0].count, 2);
        assert_eq!(state.sets[1].total, 0);
        let pending = queues.queue(&state.sets[0].queue).expect("queue").list_all().expect("list");
        assert_eq!(pending, state.sets[0].operations);
        assert!(queues.exists(&state.sets[1].queue));
        assert_eq!(store.load(state.id).expect("load"), Some(state));
    }

    #[test]
    fn test_submit_rejects_unknown_operation() {
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let registry = OperationRegistry::with_builtins();
        let memory = FixedMemoryProbe::unlimited();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);

        let definition = BatchDefinition {
            sets: vec![SetDefinition {
                operations: vec![WorkItem::new("does_not_exist", vec![])],
                ..SetDefinition::default()
            }],
        };
        assert!(matches!(submit(definition, &rt), Err(BatchError::Validation(_))));
        assert!(store.is_empty());
    }
}
