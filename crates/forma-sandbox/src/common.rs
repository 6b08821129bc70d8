//! Worker process supervision shared by script execution and rendering.
//!
//! Workers are spawned in their own process group so that a timeout or a
//! memory overrun takes down everything the worker started, not just the
//! interpreter.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Memory check interval in milliseconds
pub const MEMORY_CHECK_INTERVAL_MS: u64 = 100;

/// Captured stderr is truncated to this many bytes (tail kept).
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Hard limits for one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout_secs: u64,
    pub max_memory_mb: u64,
}

impl ResourceLimits {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

/// Why the supervisor killed a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Timeout,
    MemoryLimit { peak_mb: u64 },
}

/// What a finished (or killed) worker left behind.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub killed: Option<Termination>,
    pub elapsed: Duration,
}

/// Resident set size of a process in bytes, from /proc.
#[cfg(target_os = "linux")]
pub fn get_process_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Resident set size of a process in bytes, via `ps`.
#[cfg(target_os = "macos")]
pub fn get_process_memory(pid: u32) -> Option<u64> {
    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()
        .map(|kb| kb * 1024)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn get_process_memory(_pid: u32) -> Option<u64> {
    None
}

/// Put the child in a fresh process group (pgid = its pid).
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// SIGKILL the child's whole process group, then reap the child.
pub fn kill_worker(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            tracing::debug!(pid = child.id(), error = %e, "killpg failed, killing leader only");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Spawn `cmd` with piped stdio, feed `input` on stdin, and supervise it.
pub fn run_worker(mut cmd: Command, input: &[u8], limits: ResourceLimits) -> Result<WorkerOutput> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let mut child = cmd.spawn().context("Failed to spawn worker process")?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input) {
            kill_worker(&mut child);
            return Err(anyhow::anyhow!("Failed to write worker request: {}", e));
        }
        // Dropping stdin closes the pipe so the worker sees EOF.
    }

    wait_with_timeout(&mut child, limits)
}

/// Wait for the child while enforcing the wall-clock and memory limits.
///
/// stdout/stderr are drained on background threads while the process runs;
/// otherwise a child writing more than a pipe buffer would block forever.
pub fn wait_with_timeout(child: &mut Child, limits: ResourceLimits) -> Result<WorkerOutput> {
    let start = Instant::now();
    let timeout = Duration::from_secs(limits.timeout_secs);
    let check_interval = Duration::from_millis(MEMORY_CHECK_INTERVAL_MS);
    let memory_limit = limits.max_memory_bytes();

    let stdout_handle = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });
    let stderr_handle = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match err.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > MAX_STDERR_BYTES * 2 {
                            buf.drain(..buf.len() - MAX_STDERR_BYTES);
                        }
                    }
                }
            }
            tail(&String::from_utf8_lossy(&buf), MAX_STDERR_BYTES)
        })
    });

    let join = |handle: Option<thread::JoinHandle<String>>| {
        handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default()
    };

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(WorkerOutput {
                    stdout: join(stdout_handle),
                    stderr: join(stderr_handle),
                    exit_code: status.code().unwrap_or(-1),
                    killed: None,
                    elapsed: start.elapsed(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                kill_worker(child);
                let _ = join(stdout_handle);
                let _ = join(stderr_handle);
                return Err(anyhow::anyhow!("Failed to wait for worker: {}", e));
            }
        }

        let killed = if start.elapsed() > timeout {
            Some(Termination::Timeout)
        } else {
            get_process_memory(child.id())
                .filter(|rss| *rss > memory_limit)
                .map(|rss| Termination::MemoryLimit {
                    peak_mb: rss / (1024 * 1024),
                })
        };

        if let Some(reason) = killed {
            tracing::warn!(pid = child.id(), ?reason, "killing worker process group");
            kill_worker(child);
            // Grandchildren may still hold the pipes open; the group kill
            // above closes them, so these joins return promptly.
            let stdout = join(stdout_handle);
            let stderr = join(stderr_handle);
            return Ok(WorkerOutput {
                stdout,
                stderr,
                exit_code: -1,
                killed: Some(reason),
                elapsed: start.elapsed(),
            });
        }

        thread::sleep(check_interval);
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
