//! Built-in operations and finished callbacks
//!
//! These are what the `drubatch` binary can run from a JSON batch
//! definition. Library users register their own handlers alongside them.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::info;

use super::{BatchContext, FinishedArgs, OperationRegistry};
use crate::batch::progress::format_interval;
use crate::command_runner::{ShellCommand, run_command_safe};

/// Operations available to every batch definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinOperation {
    /// Completes immediately
    Noop,
    /// Appends its first argument to the set's results
    Echo,
    /// Sleeps for `arguments[0]` milliseconds
    Sleep,
    /// Counts to `arguments[0]` one step per call, reporting fractional progress
    Count,
    /// Runs `arguments[0]` through `sh -c`
    Shell,
}

/// Finished callbacks available to every batch definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinFinished {
    /// Logs a one-line summary of the set
    Summary,
}

/// Register every built-in into `registry`
pub fn register_all(registry: &mut OperationRegistry) {
    for op in BuiltinOperation::iter() {
        registry.register(op.to_string(), move |args, ctx| op.run(args, ctx));
    }
    for callback in BuiltinFinished::iter() {
        registry.register_finished(callback.to_string(), move |args| callback.run(args));
    }
}

impl BuiltinOperation {
    pub fn run(self, args: &[Value], ctx: &mut BatchContext<'_>) -> Result<()> {
        match self {
            Self::Noop => Ok(()),
            Self::Echo => echo(args, ctx),
            Self::Sleep => sleep(args, ctx),
            Self::Count => count(args, ctx),
            Self::Shell => shell(args, ctx),
        }
    }
}

impl BuiltinFinished {
    pub fn run(self, args: FinishedArgs<'_>) -> Result<()> {
        match self {
            Self::Summary => {
                info!(
                    "Batch set {}: {} result(s) from {} operation(s) in {}",
                    if args.success { "succeeded" } else { "failed" },
                    args.results.len(),
                    args.operations.len(),
                    format_interval(args.elapsed)
                );
                Ok(())
            }
        }
    }
}

fn arg_u64(args: &[Value], index: usize, name: &str) -> Result<u64> {
    args.get(index)
        .and_then(Value::as_u64)
        .with_context(|| format!("argument {} ({}) must be a non-negative integer", index, name))
}

fn echo(args: &[Value], ctx: &mut BatchContext<'_>) -> Result<()> {
    let value = args.first().cloned().unwrap_or(Value::Null);
    ctx.message = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ctx.results.push(value);
    Ok(())
}

fn sleep(args: &[Value], ctx: &mut BatchContext<'_>) -> Result<()> {
    let millis = arg_u64(args, 0, "milliseconds")?;
    std::thread::sleep(Duration::from_millis(millis));
    ctx.message = format!("Slept {} ms", millis);
    Ok(())
}

/// One step per call. Progress lives in the sandbox so the item resumes
/// where it left off in the next invocation.
fn count(args: &[Value], ctx: &mut BatchContext<'_>) -> Result<()> {
    let max = arg_u64(args, 0, "max")?;
    if max == 0 {
        ctx.results.push(json!({ "counted": 0 }));
        return Ok(());
    }

    let progress = ctx
        .sandbox
        .get("progress")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1;
    ctx.sandbox.insert("progress".into(), json!(progress));
    ctx.sandbox.insert("max".into(), json!(max));

    ctx.finished = (progress as f64 / max as f64).min(1.0);
    ctx.message = format!("Counted {} of {}", progress, max);

    if progress >= max {
        ctx.results.push(json!({ "counted": max }));
    }
    Ok(())
}

fn shell(args: &[Value], ctx: &mut BatchContext<'_>) -> Result<()> {
    let Some(command) = args.first().and_then(Value::as_str) else {
        bail!("argument 0 (command) must be a string");
    };

    let output = run_command_safe(&ShellCommand {
        command: command.to_string(),
    })?;

    ctx.results.push(json!({
        "command": command,
        "exit_code": output.exit_code,
        "stdout": output.stdout.trim_end(),
    }));
    ctx.message = format!("Ran `{}`", command);

    output.ensure_success(command)
}
