//! Execution spawners
//!
//! [`SubprocessSpawner`] re-runs the current executable's `process`
//! subcommand so every invocation starts with a fresh heap. The worker
//! prints its [`BatchReport`](crate::invocation::BatchReport) as the last
//! line on stdout. [`InProcessSpawner`] calls the entry point directly.

use serde_json::{Map, Value};
use std::io;
use std::path::PathBuf;
use tracing::debug;

use crate::command_runner::{CommandArgs, run_command_safe};
use crate::config::{ENV_ACTOR, EngineConfig};
use crate::driver::{ExecutionSpawner, PROCESS_COMMAND, SpawnContext, SpawnOutcome};
use crate::invocation::process_batch;
use crate::runtime::BatchRuntime;

/// Command line of one worker subprocess
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub state_dir: PathBuf,
    pub memory_limit: String,
    pub actor: Option<String>,
}

impl CommandArgs for WorkerInvocation {
    fn program(&self) -> String {
        self.program.display().to_string()
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--state-dir".to_string(),
            self.state_dir.display().to_string(),
            "--memory-limit".to_string(),
            self.memory_limit.clone(),
            self.command.clone(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.actor
            .iter()
            .map(|actor| (ENV_ACTOR.to_string(), actor.clone()))
            .collect()
    }

    // Worker logs go straight to the terminal; stdout carries the report
    fn inherit_stderr(&self) -> bool {
        true
    }
}

/// Last non-empty stdout line, if it is a JSON object
pub fn parse_report(stdout: &str) -> Option<Map<String, Value>> {
    let line = stdout.lines().map(str::trim).rfind(|line| !line.is_empty())?;
    match serde_json::from_str(line) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Starts each invocation as a child process of the given program
#[derive(Debug, Clone)]
pub struct SubprocessSpawner {
    program: PathBuf,
    state_dir: PathBuf,
    memory_limit: String,
}

impl SubprocessSpawner {
    /// Spawn the currently running executable
    pub fn new(config: &EngineConfig) -> io::Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, config))
    }

    pub fn with_program(program: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            program: program.into(),
            state_dir: config.state_dir.clone(),
            memory_limit: config.memory_limit.clone(),
        }
    }

    fn invocation(
        &self,
        command: &str,
        args: &[String],
        context: &SpawnContext,
    ) -> WorkerInvocation {
        WorkerInvocation {
            program: self.program.clone(),
            command: command.to_string(),
            args: args.to_vec(),
            state_dir: self.state_dir.clone(),
            memory_limit: self.memory_limit.clone(),
            actor: context.actor.clone(),
        }
    }
}

impl ExecutionSpawner for SubprocessSpawner {
    fn spawn(&self, command: &str, args: &[String], context: &SpawnContext) -> SpawnOutcome {
        let invocation = self.invocation(command, args, context);

        let output = match run_command_safe(&invocation) {
            Ok(output) => output,
            Err(e) => return SpawnOutcome::failure(format!("{:#}", e)),
        };
        if let Err(e) = output.ensure_success("worker invocation") {
            return SpawnOutcome::failure(e.to_string());
        }

        SpawnOutcome {
            error: None,
            result: parse_report(&output.stdout),
        }
    }
}

/// Runs each invocation inside the current process
#[derive(Debug, Clone, Copy)]
pub struct InProcessSpawner<'a> {
    rt: BatchRuntime<'a>,
}

impl<'a> InProcessSpawner<'a> {
    pub fn new(rt: BatchRuntime<'a>) -> Self {
        Self { rt }
    }
}

impl ExecutionSpawner for InProcessSpawner<'_> {
    fn spawn(&self, command: &str, args: &[String], context: &SpawnContext) -> SpawnOutcome {
        if command != PROCESS_COMMAND {
            return SpawnOutcome::failure(format!("unsupported command '{}'", command));
        }
        let Some(id) = args.first().and_then(|arg| arg.parse::<u64>().ok()) else {
            return SpawnOutcome::failure(format!("expected a batch id, got {:?}", args));
        };
        // A signalled driver must not keep starting invocations
        if self.rt.interrupted() {
            return SpawnOutcome::failure("interrupted");
        }
        if let Some(actor) = &context.actor {
            debug!("Processing batch {} in-process as {}", id, actor);
        }

        match process_batch(id, &self.rt).and_then(|report| report.to_map()) {
            Ok(map) => SpawnOutcome::success(map),
            Err(e) => SpawnOutcome::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchDefinition, SetDefinition, WorkItem};
    use crate::driver::{FINISHED_KEY, drive, submit};
    use crate::memory::FixedMemoryProbe;
    use crate::operations::OperationRegistry;
    use crate::queue::MemoryQueueProvider;
    use crate::store::MemoryBatchStore;
    use serde_json::json;

    #[test]
    fn test_parse_report_takes_last_json_line() {
        let stdout = "some noise\n{\"batch_process_finished\":false}\n\n";
        let report = parse_report(stdout).expect("report");
        assert_eq!(report.get(FINISHED_KEY), Some(&json!(false)));

        assert!(parse_report("").is_none());
        assert!(parse_report("not json\n").is_none());
        assert!(parse_report("[1, 2]\n").is_none());
    }

    #[test]
    fn test_worker_invocation_args() {
        let invocation = WorkerInvocation {
            program: PathBuf::from("/usr/bin/drubatch"),
            command: PROCESS_COMMAND.into(),
            args: vec!["12".into()],
            state_dir: PathBuf::from("/var/lib/drubatch"),
            memory_limit: "256M".into(),
            actor: Some("admin".into()),
        };
        assert_eq!(invocation.program(), "/usr/bin/drubatch");
        assert_eq!(
            invocation.to_cli_args(),
            vec![
                "--state-dir",
                "/var/lib/drubatch",
                "--memory-limit",
                "256M",
                "process",
                "12"
            ]
        );
        assert_eq!(
            invocation.get_env_vars(),
            vec![(ENV_ACTOR.to_string(), "admin".to_string())]
        );
        assert!(invocation.inherit_stderr());
    }

    #[test]
    fn test_subprocess_spawner_reads_stdout_report() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-worker");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"args: $*\"\necho '{\"batch_process_finished\":true,\"percentage\":\"100\"}'\n",
        )
        .expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let spawner = SubprocessSpawner::with_program(&script, &EngineConfig::default());
        let outcome = spawner.spawn(PROCESS_COMMAND, &["3".into()], &SpawnContext::default());

        assert!(outcome.error.is_none());
        let result = outcome.result.expect("result");
        assert_eq!(result.get(FINISHED_KEY), Some(&json!(true)));
    }

    #[test]
    fn test_subprocess_spawner_reports_exit_failure() {
        let spawner = SubprocessSpawner::with_program("false", &EngineConfig::default());
        let outcome = spawner.spawn(PROCESS_COMMAND, &["1".into()], &SpawnContext::default());
        assert_eq!(
            outcome.error.as_deref(),
            Some("worker invocation failed (exit code 1)")
        );
    }

    #[test]
    fn test_subprocess_failure_carries_last_stdout_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("failing-worker");
        std::fs::write(&script, "#!/bin/sh\necho 'batch 3 is locked'\nexit 4\n").expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let spawner = SubprocessSpawner::with_program(&script, &EngineConfig::default());
        let outcome = spawner.spawn(PROCESS_COMMAND, &["3".into()], &SpawnContext::default());
        assert_eq!(
            outcome.error.as_deref(),
            Some("worker invocation failed (exit code 4): batch 3 is locked")
        );
    }

    #[test]
    fn test_in_process_spawner_drives_batch() {
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let registry = OperationRegistry::with_builtins();
        let memory = FixedMemoryProbe::exhausted();
        let rt = BatchRuntime::new(&store, &queues, &registry, &memory);

        let definition = BatchDefinition {
            sets: vec![SetDefinition {
                operations: (0..4).map(|i| WorkItem::new("echo", vec![json!(i)])).collect(),
                ..SetDefinition::default()
            }],
        };
        let id = submit(definition, &rt).expect("submit").id;

        let spawner = InProcessSpawner::new(rt);
        let summary = drive(id, &spawner, &SpawnContext::default()).expect("drive");

        assert_eq!(summary.invocations, 4);
        assert_eq!(summary.result.get("percentage"), Some(&json!("100")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_in_process_spawner_rejects_bad_arguments() {
        let store = MemoryBatchStore::new();
        let queues = MemoryQueueProvider::new();
        let registry = OperationRegistry::new();
        let memory = FixedMemoryProbe::unlimited();
        let spawner = InProcessSpawner::new(BatchRuntime::new(&store, &queues, &registry, &memory));

        let ctx = SpawnContext::default();
        assert!(spawner.spawn("status", &["1".into()], &ctx).error.is_some());
        assert!(spawner.spawn(PROCESS_COMMAND, &["x".into()], &ctx).error.is_some());
        let missing = spawner.spawn(PROCESS_COMMAND, &["5".into()], &ctx);
        assert!(missing.error.expect("error").contains("not found"));
    }
}
