//! Process lifecycle tests for spawned workers
//!
//! Verify that:
//! 1. Commands started through run_command_safe lead their own process group
//! 2. Signalling the group stops the worker and everything it started

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use drubatch::command_runner::{ShellCommand, run_command_safe};
use drubatch::process_guard::CommandProcessGroup;

/// Alive and not a zombie
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_command_runs_in_own_process_group() {
    let output = run_command_safe(&ShellCommand {
        command: "echo $$; cut -d' ' -f5 /proc/$$/stat".into(),
    })
    .expect("spawn sh");
    assert!(output.success);

    let lines: Vec<&str> = output.stdout.lines().map(str::trim).collect();
    assert_eq!(lines.len(), 2, "unexpected output: {:?}", output.stdout);
    assert_eq!(lines[0], lines[1], "pid should equal its process group id");

    let own_pgid = nix::unistd::getpgrp().as_raw().to_string();
    assert_ne!(lines[1], own_pgid);
}

#[test]
fn test_group_signal_stops_worker_and_children() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // A worker that itself started a long-running child
    let mut parent = Command::new("sh")
        .args(["-c", "sleep 1000 & echo $!; wait"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn sh");

    let parent_pid = parent.id();

    let mut line = String::new();
    {
        use std::io::BufRead;
        let stdout = parent.stdout.take().expect("stdout");
        std::io::BufReader::new(stdout)
            .read_line(&mut line)
            .expect("read child pid");
    }
    let child_pid: u32 = line.trim().parse().expect("child pid");
    assert!(is_process_alive(child_pid));

    kill(Pid::from_raw(-(parent_pid as i32)), Signal::SIGTERM).expect("group kill");

    assert!(wait_for_process_death(child_pid, Duration::from_secs(3)));
    let _ = parent.wait();
}
