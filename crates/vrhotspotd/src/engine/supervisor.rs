//! Engine process supervision.
//!
//! One [`EngineHandle`] owns the spawned pipeline: its process group, its
//! stdout/stderr ring buffers, and its exit record. Dropping a handle kills
//! the group, so no orphaned children can outlive the core.

use super::cmd::EngineSpec;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vrhotspot_shared::error::ErrorKind;

/// Ring buffer depth for each captured stream.
pub const ENGINE_TAIL_MAX_LINES: usize = 200;

/// Exits within this window after spawn classify as early crashes.
const EARLY_CRASH_WINDOW: Duration = Duration::from_secs(5);

/// Grace poll cadence while waiting for the group to die.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Classified engine exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    Signal,
    CrashEarly,
    CrashLate,
    DriverRejectedChannel,
    MissingBinary,
    DependencyMissing,
    Unknown,
}

impl ExitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::Clean => "clean",
            ExitClass::Signal => "signal",
            ExitClass::CrashEarly => "crash_early",
            ExitClass::CrashLate => "crash_late",
            ExitClass::DriverRejectedChannel => "driver_rejected_channel",
            ExitClass::MissingBinary => "missing_binary",
            ExitClass::DependencyMissing => "dependency_missing",
            ExitClass::Unknown => "unknown",
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ExitClass::DriverRejectedChannel => ErrorKind::DriverRejectedChannel,
            ExitClass::MissingBinary => ErrorKind::MissingBinary,
            ExitClass::DependencyMissing => ErrorKind::DependencyMissing,
            ExitClass::CrashEarly => ErrorKind::EngineCrashEarly,
            _ => ErrorKind::EngineCrashLate,
        }
    }
}

/// Spawn-time failure, before a handle exists.
#[derive(Debug, Clone)]
pub struct SpawnFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
struct ExitRecord {
    code: Option<i32>,
    signal: Option<i32>,
    /// Runtime at exit, for early/late classification.
    uptime: Duration,
}

type Tail = Arc<Mutex<VecDeque<String>>>;

fn push_line(tail: &Tail, line: String) {
    let mut guard = tail.lock().expect("tail lock");
    if guard.len() == ENGINE_TAIL_MAX_LINES {
        guard.pop_front();
    }
    guard.push_back(line);
}

fn snapshot(tail: &Tail) -> Vec<String> {
    tail.lock().expect("tail lock").iter().cloned().collect()
}

/// Substrings in engine output that mean the driver refused the channel
/// or band we asked for.
const DRIVER_CHANNEL_MARKERS: [&str; 6] = [
    "could not set channel",
    "invalid/unknown channel",
    "configured channel",
    "could not select hw_mode and channel",
    "hardware does not support configured channel",
    "acs: failed",
];

const DEPENDENCY_MARKERS: [&str; 3] = [
    "command not found",
    "no such file or directory",
    "error while loading shared libraries",
];

fn tail_has_marker(lines: &[String], markers: &[&str]) -> bool {
    lines.iter().any(|line| {
        let low = line.to_ascii_lowercase();
        markers.iter().any(|m| low.contains(m))
    })
}

/// A supervised engine pipeline.
#[derive(Debug)]
pub struct EngineHandle {
    pid: u32,
    secondary_pid: Option<u32>,
    redacted_cmd: Vec<String>,
    started_ts: i64,
    started: Instant,
    expected_ap_ifname: Option<String>,

    stdout_tail: Tail,
    stderr_tail: Tail,
    primary_exit: Arc<Mutex<Option<ExitRecord>>>,
    secondary_exit: Arc<Mutex<Option<ExitRecord>>>,
    config_dir: Mutex<Option<PathBuf>>,
    stopping: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Spawn the engine in its own process group, wire up line capture and
    /// the exit waiters.
    pub fn spawn(spec: &EngineSpec) -> Result<Self, SpawnFailure> {
        let stdout_tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
        let primary_exit = Arc::new(Mutex::new(None));
        let secondary_exit = Arc::new(Mutex::new(None));
        let started = Instant::now();

        let mut primary = spawn_child(
            &spec.program,
            &spec.args,
            &spec.env,
        )
        .map_err(|e| classify_spawn_error(&spec.program, e))?;
        let pid = primary.id().unwrap_or_default();

        wire_streams(&mut primary, &stdout_tail, &stderr_tail);
        spawn_waiter(primary, Arc::clone(&primary_exit), started);

        let mut secondary_pid = None;
        if let Some((program, args)) = &spec.secondary {
            match spawn_child(program, args, &spec.env) {
                Ok(mut child) => {
                    secondary_pid = child.id();
                    wire_streams(&mut child, &stdout_tail, &stderr_tail);
                    spawn_waiter(child, Arc::clone(&secondary_exit), started);
                }
                Err(e) => {
                    // The primary is already up; tear it down before failing.
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    return Err(classify_spawn_error(program, e));
                }
            }
        }

        info!(
            pid,
            backend = spec.backend.as_str(),
            "engine spawned"
        );
        push_line(
            &stderr_tail,
            format!("[supervisor] engine spawned pid={pid}"),
        );

        Ok(Self {
            pid,
            secondary_pid,
            redacted_cmd: spec.redacted_argv(),
            started_ts: vrhotspot_shared::now_epoch(),
            started,
            expected_ap_ifname: spec.expected_ap_ifname.clone(),
            stdout_tail,
            stderr_tail,
            primary_exit,
            secondary_exit,
            config_dir: Mutex::new(spec.config_dir.clone()),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Redacted argv copy for `Status.engine.cmd`.
    pub fn redacted_cmd(&self) -> Vec<String> {
        self.redacted_cmd.clone()
    }

    pub fn started_ts(&self) -> i64 {
        self.started_ts
    }

    pub fn expected_ap_ifname(&self) -> Option<&str> {
        self.expected_ap_ifname.as_deref()
    }

    pub fn discovered_config_dir(&self) -> Option<PathBuf> {
        self.config_dir.lock().expect("config dir lock").clone()
    }

    pub fn set_discovered_config_dir(&self, dir: PathBuf) {
        *self.config_dir.lock().expect("config dir lock") = Some(dir);
    }

    /// Both supervised processes are still running.
    pub fn is_alive(&self) -> bool {
        let primary_dead = self.primary_exit.lock().expect("exit lock").is_some();
        let secondary_dead = self.secondary_pid.is_some()
            && self.secondary_exit.lock().expect("exit lock").is_some();
        !primary_dead && !secondary_dead
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.primary_exit
            .lock()
            .expect("exit lock")
            .and_then(|r| r.code)
    }

    /// Classified exit, or None while the pipeline is alive.
    pub fn exit_reason(&self) -> Option<ExitClass> {
        let record = {
            let primary = *self.primary_exit.lock().expect("exit lock");
            let secondary = *self.secondary_exit.lock().expect("exit lock");
            match (primary, secondary, self.secondary_pid) {
                (Some(r), _, _) => r,
                (None, Some(r), Some(_)) => r,
                _ => return None,
            }
        };

        if record.signal.is_some() {
            return Some(ExitClass::Signal);
        }
        if record.code == Some(0) {
            return Some(ExitClass::Clean);
        }

        let stderr = snapshot(&self.stderr_tail);
        let stdout = snapshot(&self.stdout_tail);
        if tail_has_marker(&stderr, &DRIVER_CHANNEL_MARKERS)
            || tail_has_marker(&stdout, &DRIVER_CHANNEL_MARKERS)
        {
            return Some(ExitClass::DriverRejectedChannel);
        }
        if tail_has_marker(&stderr, &DEPENDENCY_MARKERS) {
            return Some(ExitClass::DependencyMissing);
        }
        if record.code.is_some() {
            if record.uptime < EARLY_CRASH_WINDOW {
                return Some(ExitClass::CrashEarly);
            }
            return Some(ExitClass::CrashLate);
        }
        Some(ExitClass::Unknown)
    }

    /// (stdout_tail, stderr_tail) ring buffer copies.
    pub fn tail_logs(&self) -> (Vec<String>, Vec<String>) {
        (snapshot(&self.stdout_tail), snapshot(&self.stderr_tail))
    }

    /// Watch for an exit inside the spawn early-fail window.
    pub async fn wait_early(&self, window: Duration) -> Option<ExitClass> {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if !self.is_alive() {
                // Give the reader tasks a beat to flush the final lines.
                tokio::time::sleep(Duration::from_millis(100)).await;
                return self.exit_reason();
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        None
    }

    fn signal_groups(&self, signal: Signal) {
        for pid in [Some(self.pid), self.secondary_pid].into_iter().flatten() {
            match killpg(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pid, "killpg {:?} failed: {}", signal, e),
            }
        }
    }

    fn all_reaped(&self) -> bool {
        let primary = self.primary_exit.lock().expect("exit lock").is_some();
        let secondary = self.secondary_pid.is_none()
            || self.secondary_exit.lock().expect("exit lock").is_some();
        primary && secondary
    }

    /// Terminate the process group: SIGTERM, wait up to `grace`, then
    /// SIGKILL. Does not return until the group is reaped.
    pub async fn stop(&self, grace: Duration) -> Option<i32> {
        self.stopping.store(true, Ordering::SeqCst);

        if !self.all_reaped() {
            self.signal_groups(Signal::SIGTERM);
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline && !self.all_reaped() {
                tokio::time::sleep(STOP_POLL).await;
            }
        }

        if !self.all_reaped() {
            debug!(pid = self.pid, "grace expired, killing engine group");
            self.signal_groups(Signal::SIGKILL);
            // SIGKILL cannot be ignored; the waiters reap promptly.
            while !self.all_reaped() {
                tokio::time::sleep(STOP_POLL).await;
            }
        }

        self.last_exit_code()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.all_reaped() {
            warn!(pid = self.pid, "engine handle dropped while alive, killing group");
            self.signal_groups(Signal::SIGKILL);
        }
    }
}

fn spawn_child(
    program: &std::path::Path,
    args: &[String],
    env: &std::collections::HashMap<String, String>,
) -> std::io::Result<tokio::process::Child> {
    Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
}

fn classify_spawn_error(program: &std::path::Path, e: std::io::Error) -> SpawnFailure {
    let kind = if e.kind() == std::io::ErrorKind::NotFound {
        ErrorKind::MissingBinary
    } else {
        ErrorKind::EngineSpawnFailed
    };
    SpawnFailure {
        kind,
        detail: format!("{}: {}", program.display(), e),
    }
}

fn wire_streams(child: &mut tokio::process::Child, stdout_tail: &Tail, stderr_tail: &Tail) {
    if let Some(stdout) = child.stdout.take() {
        let tail = Arc::clone(stdout_tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                push_line(&tail, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tail = Arc::clone(stderr_tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                push_line(&tail, line);
            }
        });
    }
}

fn spawn_waiter(
    mut child: tokio::process::Child,
    record: Arc<Mutex<Option<ExitRecord>>>,
    started: Instant,
) {
    tokio::spawn(async move {
        let status = child.wait().await;
        let entry = match status {
            Ok(status) => ExitRecord {
                code: status.code(),
                signal: status.signal(),
                uptime: started.elapsed(),
            },
            Err(e) => {
                warn!("engine wait failed: {}", e);
                ExitRecord {
                    code: None,
                    signal: None,
                    uptime: started.elapsed(),
                }
            }
        };
        *record.lock().expect("exit lock") = Some(entry);
    });
}
