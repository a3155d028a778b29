//! The worker loop
//!
//! One call to [`run_worker`] is one invocation's worth of processing: it
//! drains items from the current set, moves on to later sets as earlier ones
//! empty out, and stops when everything is done or the memory budget is hit.
//! The caller owns persistence; the worker only mutates the state it is given.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::batch::progress::{ProgressValues, is_complete, percentage, render_message};
use crate::batch::{BatchState, unix_now};
use crate::error::{BatchError, Result};
use crate::operations::BatchContext;
use crate::runtime::BatchRuntime;

/// Why the worker loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every set has succeeded
    Drained,
    /// Memory usage crossed the budget; a new invocation should continue
    MemoryBudget,
    /// A termination signal was received
    Interrupted,
}

/// Outcome of one worker invocation
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPass {
    /// True iff the whole batch became successful
    pub finished: bool,
    pub percentage: String,
    /// Rendered progress (or init) message of the reporting set
    pub message: String,
    /// Message set by the last operation that ran
    pub task_message: String,
    /// Items that completed during this invocation
    pub items_completed: usize,
    pub stop_reason: StopReason,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Process items until the batch is complete or a budget is exceeded.
pub fn run_worker(state: &mut BatchState, rt: &BatchRuntime<'_>) -> Result<WorkerPass> {
    state.check_cursor()?;

    // Already drained by an invocation that died before teardown
    if state.is_complete() {
        return Ok(WorkerPass {
            finished: true,
            percentage: "100".to_string(),
            message: String::new(),
            task_message: String::new(),
            items_completed: 0,
            stop_reason: StopReason::Drained,
        });
    }

    if state.current().start.is_none() {
        state.current_mut().start = Some(unix_now());
    }

    let mut segment = Instant::now();
    let mut set_changed = true;
    let mut old_index = state.current_set;
    let mut finished = 1.0_f64;
    let mut task_message = String::new();
    let mut items_completed = 0;
    let mut stop_reason = StopReason::Drained;
    let mut queue = rt.queues.queue_for(state.current())?;

    while !state.current().success {
        if set_changed {
            if let Some(file) = state.current().file.as_ref().filter(|f| f.is_file()) {
                rt.registry.load_file(file).map_err(|e| {
                    BatchError::state(format!("cannot load definitions from {:?}: {:#}", file, e))
                })?;
            }
        }

        task_message.clear();
        finished = 1.0;

        if let Some(claimed) = queue.claim()? {
            let id = state.id;
            let index = state.current_set;
            let set = &mut state.sets[index];

            let mut ctx = BatchContext::new(&mut set.sandbox, &mut set.results);
            // An item's failure never aborts the rest of the batch
            if let Err(e) = rt.registry.invoke(&claimed.item, &mut ctx) {
                warn!(
                    "Batch {} set {}: operation '{}' failed: {:#}",
                    id, index, claimed.item.operation, e
                );
                if ctx.message.is_empty() {
                    ctx.message = e.to_string();
                }
            }
            let BatchContext {
                finished: level,
                message,
                ..
            } = ctx;
            finished = if level.is_nan() { 1.0 } else { level };
            task_message = message;

            if finished >= 1.0 {
                finished = 0.0;
                queue.delete(&claimed)?;
                set.count = set.count.saturating_sub(1);
                set.sandbox.clear();
                items_completed += 1;
                debug!(
                    "Batch {} set {}: item {} done, {} remaining",
                    id, index, claimed.item_id, set.count
                );
            } else {
                debug!(
                    "Batch {} set {}: item {} at {:.0}%",
                    id,
                    index,
                    claimed.item_id,
                    finished * 100.0
                );
            }
        } else if state.current().count > 0 {
            return Err(BatchError::state(format!(
                "batch {} set {}: queue '{}' is empty but {} item(s) remain",
                state.id,
                state.current_set,
                state.current().queue,
                state.current().count
            )));
        }

        // Skip past every exhausted set, including empty ones
        set_changed = false;
        old_index = state.current_set;
        while state.current().count == 0 {
            let set = state.current_mut();
            set.success = true;
            set.elapsed_ms += elapsed_ms(segment);
            segment = Instant::now();

            if !state.advance_set() {
                break;
            }
            state.current_mut().start = Some(unix_now());
            set_changed = true;
        }

        if set_changed {
            queue = rt.queues.queue_for(state.current())?;
        }

        if rt.memory.exceeds_budget() {
            info!(
                "Batch process has consumed in excess of 50% of available memory. Starting new thread"
            );
            stop_reason = StopReason::MemoryBudget;
            break;
        }

        if rt.interrupted() {
            info!("Batch {} interrupted, saving progress", state.id);
            stop_reason = StopReason::Interrupted;
            break;
        }
    }

    if !state.current().success {
        state.current_mut().elapsed_ms += elapsed_ms(segment);
    }

    // Right after entering a new set, report from that set; otherwise from
    // the set the last item ran in.
    let (reporting, template) = if set_changed {
        task_message.clear();
        let set = state.current();
        (set, &set.init_message)
    } else {
        let set = &state.sets[old_index];
        (set, &set.progress_message)
    };

    let remaining = reporting.count;
    let total = reporting.total;
    let current = total as f64 - remaining as f64 + finished;
    let percentage = percentage(total, current);
    let message = render_message(
        template,
        &ProgressValues {
            current,
            remaining,
            total,
            percentage: &percentage,
            elapsed: Duration::from_secs_f64(reporting.elapsed_ms.max(0.0) / 1000.0),
        },
    );

    info!("Batch {}: {} ({}%)", state.id, message, percentage);

    Ok(WorkerPass {
        finished: is_complete(&percentage),
        percentage,
        message,
        task_message,
        items_completed,
        stop_reason,
    })
}
