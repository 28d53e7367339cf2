//! Isolated child processes (unix)
//!
//! The child runs in its own session and process group with a cleared
//! environment, a throwaway working directory and hard rlimits. The parent
//! waits with `waitid(WNOWAIT)` first so the process group stays reserved
//! until every kill decision has been made, then reaps with `wait4` to
//! collect resource usage.

use super::{mentions_memory_exhaustion, parse_envelope, stderr_tail, PluginCommand, PluginInput};
use crate::config::{SandboxConfig, SandboxLimits};
use crate::error::{Result, WardenError};
use crate::types::{ResourceUsage, SandboxFailure, SandboxResult};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{setsid, Pid};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long output readers may lag behind the reaped child. A descendant
/// that escaped the process group can hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);

/// SIGKILL the whole process group. Errors (group already gone) are ignored.
pub(super) fn kill_group(pgid: i32) {
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

/// Bytes captured from one output stream
#[derive(Debug, Default)]
pub(super) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Output stream drained on its own thread
pub(super) struct OutputReader {
    captured: Arc<Mutex<Captured>>,
    // disconnects when the stream closes
    done: mpsc::Receiver<()>,
}

impl OutputReader {
    /// Take whatever arrived, waiting for end-of-stream until `deadline`
    fn finish(self, deadline: Instant, name: &str) -> Captured {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(mpsc::RecvTimeoutError::Timeout) = self.done.recv_timeout(remaining) {
            tracing::debug!("{} still held open after exit, keeping partial output", name);
        }
        match self.captured.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Everything observed about a finished child
#[derive(Debug)]
pub(super) struct ProcessOutcome {
    pub status: WaitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub cpu_seconds: f64,
    pub peak_memory: u64,
}

/// Why the parent killed the child, if it did
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct KillCause {
    pub watchdog: bool,
    pub cancel: bool,
}

/// A spawned child that has not been reaped yet
pub(super) struct SpawnedChild {
    pid: Pid,
    started: Instant,
    stdout: OutputReader,
    stderr: OutputReader,
    // removed when the child is reaped
    _workdir: TempDir,
}

impl SpawnedChild {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Block until the child exits. `on_exit` runs after the exit is observed
    /// but before the child is reaped. Output still open after the reap is
    /// collected for at most `READER_GRACE`.
    pub fn wait(self, on_exit: impl FnOnce()) -> io::Result<ProcessOutcome> {
        wait_exited(self.pid)?;
        on_exit();
        let (status, usage) = reap(self.pid)?;

        let deadline = Instant::now() + READER_GRACE;
        let stdout = self.stdout.finish(deadline, "stdout");
        let stderr = self.stderr.finish(deadline, "stderr");

        Ok(ProcessOutcome {
            status,
            stdout,
            stderr,
            cpu_seconds: timeval_secs(usage.ru_utime) + timeval_secs(usage.ru_stime),
            peak_memory: max_rss_bytes(usage.ru_maxrss),
        })
    }
}

/// Start `command` with the sandbox environment and, when `isolated`, rlimits
pub(super) fn spawn(
    command: &PluginCommand,
    input: &PluginInput,
    limits: &SandboxLimits,
    config: &SandboxConfig,
    isolated: bool,
) -> Result<SpawnedChild> {
    let payload = serde_json::to_vec(input)?;

    let workdir = tempfile::Builder::new()
        .prefix("warden-plugin-")
        .tempdir()
        .map_err(|e| WardenError::IsolationSetup(format!("cannot create work dir: {}", e)))?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(workdir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear();
    for key in &config.env_allowlist {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("HOME", workdir.path()).env("TMPDIR", workdir.path());
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let limits = *limits;
    // Runs in the forked child before exec; only async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || {
            setsid()?;
            if isolated {
                apply_rlimits(&limits)?;
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        WardenError::IsolationSetup(format!(
            "cannot start {}: {}",
            command.program.display(),
            e
        ))
    })?;
    let started = Instant::now();
    let pid = Pid::from_raw(child.id() as i32);

    let max_output = config.max_output_bytes;
    if let Some(mut pipe) = child.stdin.take() {
        // detached; a child that never reads stdin just closes the pipe
        std::thread::spawn(move || {
            let _ = pipe.write_all(&payload);
            let _ = pipe.write_all(b"\n");
        });
    }
    let stdout = capture(child.stdout.take(), max_output);
    let stderr = capture(child.stderr.take(), max_output);

    Ok(SpawnedChild {
        pid,
        started,
        stdout,
        stderr,
        _workdir: workdir,
    })
}

fn apply_rlimits(limits: &SandboxLimits) -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_AS, limits.max_memory, limits.max_memory)?;
    // soft limit raises SIGXCPU; the hard limit one second later is fatal
    setrlimit(
        Resource::RLIMIT_CPU,
        limits.max_cpu_seconds,
        limits.max_cpu_seconds.saturating_add(1),
    )?;
    setrlimit(
        Resource::RLIMIT_FSIZE,
        limits.max_output_file_size,
        limits.max_output_file_size,
    )?;
    setrlimit(
        Resource::RLIMIT_NOFILE,
        limits.max_open_files,
        limits.max_open_files,
    )?;
    setrlimit(
        Resource::RLIMIT_NPROC,
        limits.max_processes,
        limits.max_processes,
    )?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

/// Read a stream on its own thread, keeping at most `limit` bytes and
/// draining the rest so the child never blocks on a full pipe.
fn capture<R: Read + Send + 'static>(stream: Option<R>, limit: usize) -> OutputReader {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let (done, rx) = mpsc::channel::<()>();
    let shared = Arc::clone(&captured);
    std::thread::spawn(move || {
        let _done = done;
        let Some(mut stream) = stream else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let Ok(mut captured) = shared.lock() else {
                break;
            };
            let room = limit.saturating_sub(captured.bytes.len());
            if n > room {
                captured.truncated = true;
            }
            captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
        }
    });
    OutputReader { captured, done: rx }
}

/// Wait for exit without reaping, so the pid and process group stay reserved
fn wait_exited(pid: Pid) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reap the child and collect its resource usage
fn reap(pid: Pid) -> io::Result<(WaitStatus, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data; wait4 only writes into it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    let status = WaitStatus::from_raw(pid, status).map_err(io::Error::from)?;
    Ok((status, usage))
}

fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(target_os = "macos")]
fn max_rss_bytes(max_rss: libc::c_long) -> u64 {
    max_rss.max(0) as u64
}

#[cfg(not(target_os = "macos"))]
fn max_rss_bytes(max_rss: libc::c_long) -> u64 {
    (max_rss.max(0) as u64).saturating_mul(1024)
}

/// Turn a reaped child into a `SandboxResult`
pub(super) fn classify(
    outcome: &ProcessOutcome,
    killed: KillCause,
    limits: &SandboxLimits,
    max_output_bytes: usize,
    wall_seconds: f64,
) -> SandboxResult {
    let usage = ResourceUsage {
        cpu_seconds: outcome.cpu_seconds,
        peak_memory: outcome.peak_memory,
        wall_seconds,
    };
    match classify_failure(outcome, killed, limits, max_output_bytes) {
        Ok(value) => SandboxResult::ok(value, usage),
        Err(failure) => SandboxResult::failed(failure, usage),
    }
}

fn classify_failure(
    outcome: &ProcessOutcome,
    killed: KillCause,
    limits: &SandboxLimits,
    max_output_bytes: usize,
) -> std::result::Result<serde_json::Value, SandboxFailure> {
    if killed.watchdog {
        return Err(SandboxFailure::Timeout(format!(
            "wall-clock limit of {}s exceeded",
            limits.max_wall_seconds
        )));
    }
    if killed.cancel {
        return Err(SandboxFailure::Timeout("cancelled".into()));
    }

    let stderr = String::from_utf8_lossy(&outcome.stderr.bytes);
    let cpu_exhausted = outcome.cpu_seconds >= limits.max_cpu_seconds as f64;

    match outcome.status {
        WaitStatus::Exited(_, 0) => {
            if outcome.stdout.truncated {
                return Err(SandboxFailure::InvalidOutput(format!(
                    "output exceeded {} bytes",
                    max_output_bytes
                )));
            }
            parse_envelope(&outcome.stdout.bytes)
        }
        WaitStatus::Signaled(_, Signal::SIGXCPU, _) => Err(SandboxFailure::Timeout(format!(
            "CPU time limit of {}s exceeded",
            limits.max_cpu_seconds
        ))),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if cpu_exhausted => {
            Err(SandboxFailure::Timeout(format!(
                "CPU time limit of {}s exceeded",
                limits.max_cpu_seconds
            )))
        }
        _ if mentions_memory_exhaustion(&stderr) => Err(SandboxFailure::MemoryExceeded(format!(
            "allocation failed under {} byte limit: {}",
            limits.max_memory,
            stderr_tail(&outcome.stderr.bytes)
        ))),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if outcome.peak_memory >= limits.max_memory => {
            Err(SandboxFailure::MemoryExceeded(format!(
                "killed at peak memory of {} bytes",
                outcome.peak_memory
            )))
        }
        WaitStatus::Signaled(_, signal, _) => Err(SandboxFailure::Crashed(format!(
            "terminated by signal {}",
            signal
        ))),
        WaitStatus::Exited(_, code) => {
            let tail = stderr_tail(&outcome.stderr.bytes);
            // a failing envelope explains the exit better than stderr
            match parse_envelope(&outcome.stdout.bytes) {
                Err(failure @ SandboxFailure::MemoryExceeded(_)) => Err(failure),
                Err(SandboxFailure::Crashed(message)) => Err(SandboxFailure::Crashed(format!(
                    "exited with status {}: {}",
                    code, message
                ))),
                _ if tail.is_empty() => Err(SandboxFailure::Crashed(format!(
                    "exited with status {}",
                    code
                ))),
                _ => Err(SandboxFailure::Crashed(format!(
                    "exited with status {}: {}",
                    code, tail
                ))),
            }
        }
        other => Err(SandboxFailure::Crashed(format!(
            "unexpected wait status {:?}",
            other
        ))),
    }
}
