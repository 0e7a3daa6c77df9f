//! Reconciliation against processes this supervisor did not launch.
//!
//! `scan` walks the OS process table looking for instances of each configured
//! executable and adopts unknown ones. `probe` is the cheap counterpart run on
//! every status query: adopted instances have no wait handle, so their death
//! is detected by delivering signal 0 to the PID.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::registry::Registry;

/// Result of probing a PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The OS reports no such process.
    Gone,
    /// The PID could not be resolved to a process at all.
    Unresolvable(String),
}

/// A process adopted by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adoption {
    pub config_id: String,
    pub instance_id: String,
    pub pid: u32,
}

/// How a config's executable is recognised in the process table.
#[derive(Debug, Clone)]
struct ExecTarget {
    base_name: String,
    exec_path: String,
    resolved: PathBuf,
}

impl ExecTarget {
    fn resolve(exec_path: &str) -> Option<Self> {
        let base_name = Path::new(exec_path).file_name()?.to_str()?.to_string();
        if base_name.is_empty() {
            return None;
        }
        let resolved = fs::canonicalize(exec_path).unwrap_or_else(|_| absolutize(exec_path));
        Some(Self {
            base_name,
            exec_path: exec_path.to_string(),
            resolved,
        })
    }

    /// Identity check for one candidate: the running image first, then the
    /// command line for interpreters started with a script argument.
    fn matches(&self, pid: u32, cmdline: &str) -> bool {
        if let Ok(exe) = fs::read_link(format!("/proc/{pid}/exe")) {
            if exe == self.resolved || exe == Path::new(&self.exec_path) {
                return true;
            }
        }
        self.mentioned_in(cmdline)
    }

    fn mentioned_in(&self, cmdline: &str) -> bool {
        cmdline.contains(&self.exec_path) || cmdline.contains(&*self.resolved.to_string_lossy())
    }
}

fn absolutize(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

/// Scans the process table for every config in `registry` and adopts
/// matching processes that are not yet tracked. One config failing does not
/// stop the others.
pub async fn scan(registry: &Registry) -> Vec<Adoption> {
    let mut adopted = Vec::new();
    for config in registry.configs().await {
        adopted.extend(scan_config(registry, &config).await);
    }
    adopted
}

async fn scan_config(registry: &Registry, config: &AppConfig) -> Vec<Adoption> {
    let Some(target) = ExecTarget::resolve(&config.exec_path) else {
        return Vec::new();
    };
    let candidates = match find_candidates(&target.base_name).await {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(app = %config.name, error = %err, "process table query failed");
            return Vec::new();
        }
    };

    let known = registry.running_pids(&config.id).await;
    let mut adopted = Vec::new();
    for (pid, cmdline) in candidates {
        if !adoptable(pid, &known) || !target.matches(pid, &cmdline) {
            continue;
        }
        if let Some(instance_id) = registry.adopt(&config.id, pid).await {
            info!(app = %config.name, pid, instance = %instance_id, "adopted external process");
            adopted.push(Adoption {
                config_id: config.id.clone(),
                instance_id,
                pid,
            });
        }
    }
    adopted
}

/// Init, the supervisor itself and already tracked PIDs are never adopted.
fn adoptable(pid: u32, known: &HashSet<u32>) -> bool {
    pid > 1 && pid != std::process::id() && !known.contains(&pid)
}

/// Checks that `pid` is still an instance of `exec_path`, using the same
/// identity rules as a scan.
pub fn runs_program(pid: u32, exec_path: &str) -> bool {
    let Some(target) = ExecTarget::resolve(exec_path) else {
        return false;
    };
    let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    target.matches(pid, &cmdline)
}

/// Lists `(pid, command line)` for processes whose command line mentions
/// `name`, falling back to an exact process-name match.
async fn find_candidates(name: &str) -> io::Result<Vec<(u32, String)>> {
    match pgrep(&["-f", "-a", name]).await {
        Ok(found) if !found.is_empty() => return Ok(found),
        Ok(_) => {}
        Err(err) => debug!(name = %name, error = %err, "pgrep -f failed, trying exact match"),
    }
    pgrep(&["-x", "-a", name]).await
}

async fn pgrep(args: &[&str]) -> io::Result<Vec<(u32, String)>> {
    let output = Command::new("pgrep").args(args).output().await?;
    // pgrep exits 1 when nothing matched.
    match output.status.code() {
        Some(0) => Ok(parse_pgrep_output(&String::from_utf8_lossy(&output.stdout))),
        Some(1) => Ok(Vec::new()),
        _ => Err(io::Error::other(format!(
            "pgrep {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

fn parse_pgrep_output(output: &str) -> Vec<(u32, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, cmdline) = line.trim().split_once(' ')?;
            Some((pid.parse().ok()?, cmdline.to_string()))
        })
        .collect()
}

/// Marks dead external instances as stopped. Launched instances are skipped;
/// their lifecycle monitor owns that transition.
pub async fn probe(registry: &Registry) -> usize {
    registry.probe_external(probe_pid).await
}

/// Checks whether `pid` still names a live process by sending signal 0.
#[cfg(unix)]
pub fn probe_pid(pid: u32) -> Liveness {
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Liveness::Unresolvable(format!("invalid pid {pid}")),
    };
    // SAFETY: signal 0 performs only the existence and permission checks.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return Liveness::Alive;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Liveness::Gone,
        // Exists, owned by someone else.
        Some(libc::EPERM) => Liveness::Alive,
        _ => Liveness::Unresolvable(format!("process not found: {err}")),
    }
}

#[cfg(not(unix))]
pub fn probe_pid(pid: u32) -> Liveness {
    Liveness::Unresolvable(format!("cannot probe pid {pid} on this platform"))
}
