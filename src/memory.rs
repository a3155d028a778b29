//! Memory budget for worker invocations
//!
//! A worker stops taking new items once its resident memory, doubled as a
//! safety margin, reaches the configured ceiling. The batch is persisted and
//! the driver starts a fresh process that picks up where this one stopped.

use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Usage is multiplied by this before comparing against the ceiling
pub const MEMORY_SAFETY_FACTOR: u64 = 2;

/// Source of memory usage and the ceiling it is checked against.
pub trait MemoryProbe {
    /// Current memory usage in bytes
    fn usage(&self) -> u64;

    /// Configured ceiling in bytes; 0 means unlimited
    fn limit(&self) -> u64;

    /// True when a ceiling is set and `usage × 2` meets or exceeds it
    fn exceeds_budget(&self) -> bool {
        let limit = self.limit();
        limit > 0 && self.usage().saturating_mul(MEMORY_SAFETY_FACTOR) >= limit
    }
}

/// Resident memory of the current process, as reported by `sysinfo`.
pub struct ProcessMemoryProbe {
    limit: u64,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new(limit: u64) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, memory budget disabled: {}", e);
                None
            }
        };
        Self {
            limit,
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn usage(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        match system.process(pid) {
            Some(process) => process.memory(),
            None => {
                debug!("Process {} missing from refresh", pid);
                0
            }
        }
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

/// A probe with fixed values, for tests and for forcing one item per invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMemoryProbe {
    pub usage: u64,
    pub limit: u64,
}

impl FixedMemoryProbe {
    /// Never over budget
    pub fn unlimited() -> Self {
        Self { usage: 0, limit: 0 }
    }

    /// Always over budget: every invocation stops after one pass
    pub fn exhausted() -> Self {
        Self { usage: 1, limit: 1 }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn usage(&self) -> u64 {
        self.usage
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}
