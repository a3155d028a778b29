//! Engine configuration
//!
//! Values are resolved in order: built-in defaults, an optional JSON file,
//! `DRUBATCH_*` environment variables, then command-line flags.

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BatchError, Result};

/// Environment variable overriding [`EngineConfig::state_dir`]
pub const ENV_STATE_DIR: &str = "DRUBATCH_STATE_DIR";
/// Environment variable overriding [`EngineConfig::memory_limit`]
pub const ENV_MEMORY_LIMIT: &str = "DRUBATCH_MEMORY_LIMIT";
/// Environment variable overriding [`EngineConfig::actor`]
pub const ENV_ACTOR: &str = "DRUBATCH_ACTOR";

pub const DEFAULT_MEMORY_LIMIT: &str = "128M";

/// Runtime configuration for the batch engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding persisted batches and queues
    pub state_dir: PathBuf,
    /// Memory ceiling per worker invocation, e.g. `512M`, `2G`, `-1`
    pub memory_limit: String,
    /// Identity forwarded to every worker invocation
    pub actor: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            actor: None,
        }
    }
}

/// `$XDG_STATE_HOME/drubatch`, falling back to `~/.local/state/drubatch`
/// and finally the system temp directory.
fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("drubatch");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        return PathBuf::from(home).join(".local/state/drubatch");
    }
    std::env::temp_dir().join("drubatch")
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Defaults, overlaid with `file` if given, then the process environment
    pub fn resolve(file: Option<&Path>) -> AnyResult<Self> {
        let mut config = match file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `DRUBATCH_*` variables looked up through `lookup`. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(limit) = lookup(ENV_MEMORY_LIMIT) {
            self.memory_limit = limit;
        }
        if let Some(actor) = lookup(ENV_ACTOR) {
            self.actor = Some(actor);
        }
    }

    /// Apply command-line overrides
    pub fn apply_overrides(
        &mut self,
        state_dir: Option<PathBuf>,
        memory_limit: Option<String>,
        actor: Option<String>,
    ) {
        if let Some(dir) = state_dir {
            self.state_dir = dir;
        }
        if let Some(limit) = memory_limit {
            self.memory_limit = limit;
        }
        if actor.is_some() {
            self.actor = actor;
        }
    }

    /// Memory ceiling in bytes, 0 meaning unlimited
    pub fn memory_limit_bytes(&self) -> Result<u64> {
        parse_memory_limit(&self.memory_limit)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(BatchError::config("state directory must be specified"));
        }
        self.memory_limit_bytes()?;
        if let Some(actor) = &self.actor {
            if actor.trim().is_empty() {
                return Err(BatchError::config("actor cannot be blank"));
            }
        }
        Ok(())
    }
}

/// Parse a size like `512M`, `2G`, `1024K` or a plain byte count.
///
/// `-1` and `0` mean unlimited and parse to 0.
pub fn parse_memory_limit(value: &str) -> Result<u64> {
    let value = value.trim();
    if value == "-1" {
        return Ok(0);
    }

    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1024),
        Some('m' | 'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(_) => (value, 1),
        None => return Err(BatchError::config("memory limit cannot be empty")),
    };

    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| BatchError::config(format!("invalid memory limit '{}'", value)))?;

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| BatchError::config(format!("memory limit '{}' is too large", value)))
}
