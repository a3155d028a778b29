//! Lifecycle management for spawned worker processes
//!
//! The driver starts one worker process per invocation. A worker that
//! outlives its driver could keep mutating the batch while a restarted
//! driver starts another one against the same id, so:
//!
//! - workers run as leaders of their own process group and receive SIGTERM
//!   when the driver dies (`PR_SET_PDEATHSIG`)
//! - running workers are tracked in [`WorkerRegistry`]
//! - when the driver stops (guard drop or a signal), every worker group is
//!   asked to stop and killed if it has not exited after a grace period
//!
//! Worker processes themselves do not terminate on a signal: they raise an
//! interrupt flag (see [`register_interrupt_flag`]) so the worker loop can
//! break out and persist the batch before exiting.

use nix::sys::prctl;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, setpgid};
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

/// Grace period when the driver's guard goes out of scope
pub const DROP_GRACE: Duration = Duration::from_secs(5);
/// Grace period when the driver itself was signalled
pub const SIGNAL_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static WORKERS: OnceLock<Arc<Mutex<WorkerRegistry>>> = OnceLock::new();

/// Process groups of the workers currently running
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    groups: BTreeSet<i32>,
    stopped: bool,
}

impl WorkerRegistry {
    /// The process-wide registry `run_command_safe` records children in
    pub fn global() -> Arc<Mutex<WorkerRegistry>> {
        Arc::clone(WORKERS.get_or_init(|| Arc::new(Mutex::new(WorkerRegistry::default()))))
    }

    pub fn register(&mut self, pid: u32) {
        self.groups.insert(pid as i32);
        debug!("Tracking worker group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        if self.groups.remove(&(pid as i32)) {
            debug!("Worker group {} exited", pid);
        }
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }

    /// SIGTERM every tracked group, then SIGKILL whatever is still running
    /// once `grace` has passed. Only the first call does anything.
    pub fn stop_all(&mut self, grace: Duration) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        let groups = std::mem::take(&mut self.groups);
        if groups.is_empty() {
            return;
        }

        info!("Stopping {} worker process(es)", groups.len());
        for &group in &groups {
            signal_group(group, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        let mut running: Vec<i32> = groups.into_iter().collect();
        while Instant::now() < deadline {
            running.retain(|&group| is_running(group));
            if running.is_empty() {
                info!("All workers exited");
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        for group in running.into_iter().filter(|&group| is_running(group)) {
            warn!("Worker group {} ignored SIGTERM, killing it", group);
            signal_group(group, Signal::SIGKILL);
        }
    }
}

/// Signal the whole group; fall back to the leader alone
fn signal_group(group: i32, signal: Signal) {
    if let Err(group_err) = kill(Pid::from_raw(-group), signal) {
        if let Err(e) = kill(Pid::from_raw(group), signal) {
            error!(
                "Cannot send {} to worker {} (group: {}, leader: {})",
                signal, group, group_err, e
            );
        }
    }
}

/// Exists and is neither a zombie nor dead
fn is_running(pid: i32) -> bool {
    let Ok(raw) = u32::try_from(pid) else {
        return false;
    };
    let pid = sysinfo::Pid::from_u32(raw);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some_and(|process| {
        !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
    })
}

/// Stops every tracked worker when dropped. The driver holds one for the
/// duration of a run.
pub struct ProcessGuard {
    registry: Arc<Mutex<WorkerRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: WorkerRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.stop_all(DROP_GRACE);
        }
    }
}

/// Driver side: on SIGINT, SIGTERM or SIGHUP stop every tracked worker and
/// exit with `128 + signal`.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("driver-signals".into())
        .spawn(move || {
            let Some(raw) = signals.forever().next() else {
                return;
            };
            let name = Signal::try_from(raw).map_or("unknown signal", Signal::as_str);
            info!("Driver received {}, stopping workers", name);
            if let Ok(mut registry) = WorkerRegistry::global().lock() {
                registry.stop_all(SIGNAL_GRACE);
            }
            std::process::exit(128 + raw);
        })?;
    Ok(())
}

/// Worker side: SIGINT, SIGTERM and SIGHUP set the returned flag instead of
/// killing the process. The worker loop polls it between items.
pub fn register_interrupt_flag() -> Result<Arc<AtomicBool>, std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        signal_hook::flag::register(sig, Arc::clone(&flag))?;
    }
    Ok(flag)
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Lead a new process group and receive SIGTERM when the parent dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;

        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            self.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                prctl::set_pdeathsig(Signal::SIGTERM)?;
                Ok(())
            });
        }
        self
    }
}
