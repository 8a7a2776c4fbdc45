//! Read-only inspectors of the host plus the bounded subprocess runner.
//!
//! Nothing in this module mutates kernel state; mutation lives with the
//! lifecycle worker and the components it drives.

pub mod facts;
pub mod firewall_probe;
pub mod iw;
pub mod net;
pub mod os_release;

pub use facts::PlatformFacts;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default deadline for host probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Exit codes mirroring shell conventions for timeout / spawn failure.
pub const CODE_TIMEOUT: i32 = 124;
pub const CODE_SPAWN_FAILED: i32 = 127;

/// Captured output of one bounded command run.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    /// stdout and stderr joined, the way probe parsers consume them.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run a command with a hard deadline. Never blocks past `timeout` and never
/// errors: timeouts report 124, spawn failures 127.
pub async fn run_cmd(program: &Path, args: &[&str], timeout: Duration) -> CmdOutput {
    let child = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .env("LANG", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(out)) => CmdOutput {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim_end().to_string(),
        },
        Ok(Err(e)) => CmdOutput {
            code: CODE_SPAWN_FAILED,
            stdout: String::new(),
            stderr: format!("spawn_failed: {e}"),
        },
        Err(_) => CmdOutput {
            code: CODE_TIMEOUT,
            stdout: String::new(),
            stderr: format!("cmd_timed_out: {}", program.display()),
        },
    }
}

/// Locate an executable on PATH, then in the sbin directories that privileged
/// tools commonly live in even when PATH omits them.
pub fn which(exe: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PATH") {
        for dir in path.split(':').filter(|d| !d.is_empty()) {
            let cand = Path::new(dir).join(exe);
            if is_executable(&cand) {
                return Some(cand);
            }
        }
    }
    for dir in ["/usr/sbin", "/usr/bin", "/sbin", "/bin"] {
        let cand = Path::new(dir).join(exe);
        if is_executable(&cand) {
            return Some(cand);
        }
    }
    None
}

pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

/// `iw` is the one probe binary we insist on resolving.
pub fn iw_bin() -> PathBuf {
    which("iw").unwrap_or_else(|| PathBuf::from("/usr/sbin/iw"))
}

pub fn ip_bin() -> PathBuf {
    which("ip").unwrap_or_else(|| PathBuf::from("/usr/sbin/ip"))
}
