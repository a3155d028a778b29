//! Explicit engine context
//!
//! There is no process-wide "current batch". Everything the worker, the
//! invocation entry point and teardown need is carried in a [`BatchRuntime`]
//! that callers build and pass down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::memory::MemoryProbe;
use crate::operations::OperationRegistry;
use crate::queue::QueueProvider;
use crate::store::BatchStore;

/// Borrowed collaborators for one engine call chain.
#[derive(Clone, Copy)]
pub struct BatchRuntime<'a> {
    pub store: &'a dyn BatchStore,
    pub queues: &'a dyn QueueProvider,
    pub registry: &'a OperationRegistry,
    pub memory: &'a dyn MemoryProbe,
    /// Raised by a signal handler; the worker stops between items when set
    pub interrupt: Option<&'a AtomicBool>,
}

impl<'a> BatchRuntime<'a> {
    pub fn new(
        store: &'a dyn BatchStore,
        queues: &'a dyn QueueProvider,
        registry: &'a OperationRegistry,
        memory: &'a dyn MemoryProbe,
    ) -> Self {
        Self {
            store,
            queues,
            registry,
            memory,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl fmt::Debug for BatchRuntime<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRuntime")
            .field("registry", self.registry)
            .field("memory_limit", &self.memory.limit())
            .field("interrupted", &self.interrupted())
            .finish()
    }
}
