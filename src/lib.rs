//! drubatch library
//!
//! A resumable batch execution engine. Work is submitted as ordered sets of
//! items, persisted, and drained by worker invocations that each stop once
//! they reach a memory budget. A driver keeps starting invocations until the
//! batch completes, then every set's finished callback runs and the batch is
//! removed.

pub mod batch;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod driver;
pub mod error;
pub mod invocation;
pub mod memory;
pub mod operations;
pub mod process_guard;
pub mod queue;
pub mod runtime;
pub mod spawner;
pub mod store;
pub mod teardown;
pub mod worker;

// Re-export main types for convenience
pub use batch::{BatchDefinition, BatchSet, BatchState, SetDefinition, WorkItem};
pub use config::EngineConfig;
pub use driver::{
    DriveSummary, ExecutionSpawner, SpawnContext, SpawnOutcome, backend_batch_process, drive,
    submit,
};
pub use error::{BatchError, Result};
pub use invocation::{BatchReport, PersistGuard, process_batch};
pub use memory::{FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use operations::{BatchContext, FinishedArgs, OperationRegistry};
pub use process_guard::{WorkerRegistry, CommandProcessGroup, ProcessGuard};
pub use queue::{FileQueueProvider, MemoryQueueProvider, QueueProvider, WorkQueue};
pub use runtime::BatchRuntime;
pub use spawner::{InProcessSpawner, SubprocessSpawner};
pub use store::{BatchStore, FileBatchStore, MemoryBatchStore};
pub use teardown::{TeardownSummary, finish_batch};
pub use worker::{StopReason, WorkerPass, run_worker};
