//! Batch definitions: the JSON shape a caller submits.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::WorkItem;
use crate::error::{BatchError, Result};
use crate::operations::OperationRegistry;

/// A batch as submitted: one or more sets, processed in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDefinition {
    pub sets: Vec<SetDefinition>,
}

/// One set of a submitted batch. Unset messages fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetDefinition {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub operations: Vec<WorkItem>,
    #[serde(default)]
    pub finished: Option<String>,
    #[serde(default)]
    pub init_message: Option<String>,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl BatchDefinition {
    /// Load a definition from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read batch definition from {:?}", path.as_ref()))?;

        let definition: Self =
            serde_json::from_str(&content).context("Failed to parse batch definition JSON")?;

        Ok(definition)
    }

    /// Total number of work items across all sets
    pub fn item_count(&self) -> usize {
        self.sets.iter().map(|set| set.operations.len()).sum()
    }

    /// Check that the batch has at least one set and that every operation
    /// and finished callback is registered.
    pub fn validate(&self, registry: &OperationRegistry) -> Result<()> {
        if self.sets.is_empty() {
            return Err(BatchError::validation("batch must contain at least one set"));
        }

        for (index, set) in self.sets.iter().enumerate() {
            for item in &set.operations {
                if !registry.has_operation(&item.operation) {
                    return Err(BatchError::validation(format!(
                        "set {} references unknown operation '{}'",
                        index, item.operation
                    )));
                }
            }

            if let Some(callback) = &set.finished {
                if !registry.has_finished(callback) {
                    return Err(BatchError::validation(format!(
                        "set {} references unknown finished callback '{}'",
                        index, callback
                    )));
                }
            }
        }

        Ok(())
    }
}
