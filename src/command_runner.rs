//! Process-group-isolated command execution
//!
//! Every external process the engine starts (worker invocations and the
//! `shell` operation) goes through [`run_command_safe`] so that:
//!
//! - the child runs in its own process group with a parent-death signal
//! - its PID is registered with [`WorkerRegistry::global()`] while it runs
//! - arguments and environment come from a typed [`CommandArgs`] value

use crate::process_guard::{CommandProcessGroup, WorkerRegistry};
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Typed description of a command to execute.
///
/// - `program()`: executable path or name resolved through `PATH`
/// - `to_cli_args()`: arguments exactly as the program expects them
/// - `get_env_vars()`: extra environment for the child
pub trait CommandArgs {
    fn program(&self) -> String;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Stream the child's stderr to ours instead of capturing it
    fn inherit_stderr(&self) -> bool {
        false
    }
}

/// Execute a command with process group isolation and wait for it.
///
/// Returns `Ok` for any exit status; callers decide what a failure means
/// via [`CommandOutput::ensure_success`]. `Err` means the process could not
/// be spawned or waited on.
pub fn run_command_safe<T: CommandArgs>(args: &T) -> Result<CommandOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    debug!(
        "run_command_safe: {} args={:?} env={:?}",
        program, cli_args, env_vars
    );

    let mut cmd = Command::new(&program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if args.inherit_stderr() {
            Stdio::inherit()
        } else {
            Stdio::piped()
        })
        .in_new_process_group();

    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", program))?;
    let pid = child.id();

    if let Ok(mut registry) = WorkerRegistry::global().lock() {
        registry.register(pid);
    }

    let output = child.wait_with_output();

    if let Ok(mut registry) = WorkerRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for command: {}", program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("Command {} executed successfully", program);
    } else {
        info!(
            "Command {} failed with exit code {}",
            program,
            result.exit_code.unwrap_or(-1)
        );
    }

    Ok(result)
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    /// Empty when stderr was inherited
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let status = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match self.failure_detail() {
            Some(detail) => anyhow::bail!("{} failed ({}): {}", context, status, detail),
            None => anyhow::bail!("{} failed ({})", context, status),
        }
    }

    /// Captured stderr, or the last stdout line when stderr was inherited
    pub fn failure_detail(&self) -> Option<&str> {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return Some(stderr);
        }
        self.stdout.lines().map(str::trim).rfind(|line| !line.is_empty())
    }
}

/// `sh -c <command>`
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
}

impl CommandArgs for ShellCommand {
    fn program(&self) -> String {
        "sh".to_string()
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-c".to_string(), self.command.clone()]
    }
}
