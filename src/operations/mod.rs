//! Operation dispatch
//!
//! Work items name their operation by string. Instead of invoking arbitrary
//! functions by name, every operation and finished callback is registered
//! up front in an [`OperationRegistry`] that maps identifiers to typed
//! handlers.
//!
//! # Execution context
//!
//! A handler receives the item's arguments and a [`BatchContext`] that
//! borrows the set's `sandbox` and `results` exclusively. Whatever the
//! handler writes is observed by the worker after the call returns:
//!
//! - `finished`: completion level of this item, defaults to 1.0. Anything
//!   below 1.0 keeps the item queued and the sandbox intact for the next call.
//! - `message`: free-form task message for progress reporting.

pub mod builtin;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::batch::WorkItem;
use crate::error::BatchError;

/// Mutable execution context handed to an operation handler.
#[derive(Debug)]
pub struct BatchContext<'a> {
    /// Private scratch space for the current item. Cleared once the item completes.
    pub sandbox: &'a mut Map<String, Value>,
    /// Accumulated results of the whole set
    pub results: &'a mut Vec<Value>,
    /// Completion level of the current item (0.0..=1.0)
    pub finished: f64,
    /// Task message for progress output
    pub message: String,
}

impl<'a> BatchContext<'a> {
    pub fn new(sandbox: &'a mut Map<String, Value>, results: &'a mut Vec<Value>) -> Self {
        Self {
            sandbox,
            results,
            finished: 1.0,
            message: String::new(),
        }
    }
}

/// Arguments passed to a set's finished callback during teardown.
#[derive(Debug, Clone, Copy)]
pub struct FinishedArgs<'a> {
    pub success: bool,
    pub results: &'a [Value],
    /// Every operation originally submitted to the set
    pub operations: &'a [WorkItem],
    pub elapsed: Duration,
}

pub type OperationHandler =
    Box<dyn Fn(&[Value], &mut BatchContext<'_>) -> anyhow::Result<()> + Send + Sync>;

pub type FinishedHandler = Box<dyn Fn(FinishedArgs<'_>) -> anyhow::Result<()> + Send + Sync>;

pub type FileLoader = Box<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// Registry of operation handlers, finished callbacks and the optional
/// loader for per-set definition files.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, OperationHandler>,
    finished: HashMap<String, FinishedHandler>,
    file_loader: Option<FileLoader>,
}

impl OperationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in operation and callback registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register an operation handler under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&[Value], &mut BatchContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Box::new(handler));
        self
    }

    /// Register a finished callback under `name`
    pub fn register_finished<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(FinishedArgs<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.finished.insert(name.into(), Box::new(handler));
        self
    }

    /// Install the loader used for per-set definition files
    pub fn set_file_loader<F>(&mut self, loader: F) -> &mut Self
    where
        F: Fn(&Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.file_loader = Some(Box::new(loader));
        self
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn has_finished(&self, name: &str) -> bool {
        self.finished.contains_key(name)
    }

    /// Sorted operation identifiers
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `item` against `context`
    pub fn invoke(&self, item: &WorkItem, context: &mut BatchContext<'_>) -> anyhow::Result<()> {
        let handler = self
            .operations
            .get(&item.operation)
            .ok_or_else(|| BatchError::UnknownOperation(item.operation.clone()))?;
        handler(&item.arguments, context)
    }

    /// Run the finished callback registered as `name`
    pub fn run_finished(&self, name: &str, args: FinishedArgs<'_>) -> anyhow::Result<()> {
        let handler = self
            .finished
            .get(name)
            .ok_or_else(|| BatchError::UnknownOperation(name.to_string()))?;
        handler(args)
    }

    /// Load a per-set definitions file. Without a loader this is a no-op.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<()> {
        match &self.file_loader {
            Some(loader) => loader(path),
            None => {
                debug!("No file loader registered, skipping {:?}", path);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut finished: Vec<&String> = self.finished.keys().collect();
        finished.sort_unstable();
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operation_names())
            .field("finished", &finished)
            .field("file_loader", &self.file_loader.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_defaults_to_complete() {
        let mut sandbox = Map::new();
        let mut results = Vec::new();
        let ctx = BatchContext::new(&mut sandbox, &mut results);
        assert_eq!(ctx.finished, 1.0);
        assert!(ctx.message.is_empty());
    }

    #[test]
    fn test_handler_writes_are_visible_after_call() {
        let mut registry = OperationRegistry::new();
        registry.register("mark", |args, ctx| {
            ctx.sandbox.insert("seen".into(), args[0].clone());
            ctx.results.push(json!("marked"));
            ctx.finished = 0.25;
            ctx.message = "working".into();
            Ok(())
        });

        let mut sandbox = Map::new();
        let mut results = Vec::new();
        let mut ctx = BatchContext::new(&mut sandbox, &mut results);
        registry
            .invoke(&WorkItem::new("mark", vec![json!(7)]), &mut ctx)
            .expect("invoke");

        assert_eq!(ctx.finished, 0.25);
        assert_eq!(ctx.message, "working");
        assert_eq!(sandbox.get("seen"), Some(&json!(7)));
        assert_eq!(results, vec![json!("marked")]);
    }

    #[test]
    fn test_unknown_operation_is_an_error() {
        let registry = OperationRegistry::new();
        let mut sandbox = Map::new();
        let mut results = Vec::new();
        let mut ctx = BatchContext::new(&mut sandbox, &mut results);
        let err = registry
            .invoke(&WorkItem::new("nope", vec![]), &mut ctx)
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_load_file_without_loader_is_noop() {
        let registry = OperationRegistry::new();
        assert!(registry.load_file(Path::new("/nonexistent")).is_ok());
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = OperationRegistry::with_builtins();
        for name in ["noop", "echo", "sleep", "count", "shell"] {
            assert!(registry.has_operation(name), "missing builtin {}", name);
        }
        assert!(registry.has_finished("summary"));
    }
}
