//! Process execution and management.
//!
//! This module contains the `ProcessManager`, the request/response surface a
//! presentation layer drives. It spawns configured applications in their own
//! process groups, forwards their output into the registry and the log sink,
//! waits for them to exit, and stops them on request.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{self, AppConfig, ConfigStore};
use crate::env::EnvBuilder;
use crate::error::{Result, SupervisorError};
use crate::events::{LogEvent, LogSink};
use crate::output::{decode_line, StreamKind};
use crate::process::{InstanceKind, KillReply, LaunchedHandle, ProcessInstance, TrackedInstance};
use crate::registry::{Registry, StatusSummary, StopTarget};
use crate::scan::{self, Adoption, Liveness};

/// Starts, stops and observes configured applications.
pub struct ProcessManager {
    registry: Arc<Registry>,
    env: EnvBuilder,
    sink: Arc<dyn LogSink>,
}

impl ProcessManager {
    pub fn new(registry: Registry, env: EnvBuilder, sink: Arc<dyn LogSink>) -> Self {
        Self {
            registry: Arc::new(registry),
            env,
            sink,
        }
    }

    /// Opens the manager over `config.json` and `settings.toml` in `dir`.
    pub fn open(dir: &Path, sink: Arc<dyn LogSink>) -> Result<Self> {
        let settings = config::load_settings(dir)?;
        let registry = Registry::open(ConfigStore::in_dir(dir), settings.max_log_lines())?;
        Ok(Self::new(registry, EnvBuilder::from_settings(&settings), sink))
    }

    pub async fn configs(&self) -> Vec<AppConfig> {
        self.registry.configs().await
    }

    /// Saves a config, assigning an id if it has none. Returns the id.
    pub async fn save_config(&self, config: AppConfig) -> Result<String> {
        self.registry.upsert_config(config).await
    }

    /// Deletes a config. Its instances are left in place.
    pub async fn delete_config(&self, id: &str) -> Result<bool> {
        self.registry.delete_config(id).await
    }

    /// Launches the application `config_id` and returns the new instance id.
    pub async fn start_app(&self, config_id: &str) -> Result<String> {
        let config = self
            .registry
            .config(config_id)
            .await
            .ok_or_else(|| SupervisorError::ConfigNotFound {
                id: config_id.to_string(),
            })?;
        // Cheap early rejection; the authoritative check happens on insert.
        if !config.allow_multi && !self.registry.running_pids(&config.id).await.is_empty() {
            return Err(SupervisorError::AlreadyRunning { name: config.name });
        }

        let env = self.env.build(&config).await;
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (instance_id, mut child) = self
            .registry
            .insert_exclusive(&config, || {
                let child = spawn_child(&config, &env)?;
                let pid = child.id().unwrap_or(0);
                let instance =
                    TrackedInstance::launched(&config.id, pid, LaunchedHandle::new(kill_tx));
                let instance_id = instance.id().to_string();
                Ok((instance, (instance_id, child)))
            })
            .await?;
        info!(
            app = %config.name,
            instance = %instance_id,
            pid = child.id().unwrap_or(0),
            "started process"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_output(
                self.registry.clone(),
                self.sink.clone(),
                instance_id.clone(),
                StreamKind::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_output(
                self.registry.clone(),
                self.sink.clone(),
                instance_id.clone(),
                StreamKind::Stderr,
                stderr,
            ));
        }
        tokio::spawn(monitor_exit(
            self.registry.clone(),
            instance_id.clone(),
            child,
            kill_rx,
        ));

        Ok(instance_id)
    }

    /// Kills a running instance and its process group. Stopping an instance
    /// that is no longer running is a no-op.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let Some(target) = self.registry.stop_target(instance_id).await? else {
            return Ok(());
        };
        let pid = target.pid;
        if let InstanceKind::External = target.kind {
            if !self.confirm_external(instance_id, &target).await? {
                return Ok(());
            }
        }

        let group_err = match kill_group(pid) {
            Ok(()) => {
                info!(instance = instance_id, pid, "killed process group");
                return Ok(());
            }
            Err(err) => err,
        };
        debug!(instance = instance_id, pid, error = %group_err, "group kill failed, signalling process");

        let direct = match &target.kind {
            InstanceKind::Launched(handle) => handle.kill().await,
            InstanceKind::External => kill_pid(pid),
        };
        match direct {
            Ok(()) => {
                info!(instance = instance_id, pid, "killed process");
                Ok(())
            }
            // Already gone: the monitor or the next probe records the exit.
            Err(err) if is_gone(&err) => Ok(()),
            Err(err) => Err(SupervisorError::StopFailed {
                pid,
                message: format!("process group: {group_err}; process: {err}"),
            }),
        }
    }

    /// Re-checks an adopted PID right before it is signalled. Returns `false`
    /// when the process has already exited, and refuses to signal a PID that
    /// no longer runs the configured program.
    async fn confirm_external(&self, instance_id: &str, target: &StopTarget) -> Result<bool> {
        let pid = target.pid;
        if scan::probe_pid(pid) == Liveness::Gone {
            self.registry.record_liveness(instance_id, Liveness::Gone).await;
            return Ok(false);
        }
        let Some(config) = self.registry.config(&target.config_id).await else {
            return Err(SupervisorError::StopFailed {
                pid,
                message: "config was deleted, cannot verify process identity".to_string(),
            });
        };
        if !scan::runs_program(pid, &config.exec_path) {
            warn!(instance = instance_id, pid, exec = %config.exec_path, "pid no longer runs the adopted program");
            return Err(SupervisorError::StopFailed {
                pid,
                message: format!("process no longer runs {}", config.exec_path),
            });
        }
        Ok(true)
    }

    /// Stops every running instance, logging failures and carrying on.
    /// Returns how many stop requests failed.
    pub async fn stop_all(&self) -> usize {
        let mut failures = 0;
        for inst in self.registry.running_instances().await {
            if let Err(err) = self.stop_instance(&inst.instance_id).await {
                warn!(instance = %inst.instance_id, pid = inst.pid, error = %err, "failed to stop instance");
                failures += 1;
            }
        }
        failures
    }

    /// Every config with its instances, after probing adopted processes.
    pub async fn all_status(&self) -> Vec<StatusSummary> {
        scan::probe(&self.registry).await;
        self.registry.summaries().await
    }

    /// Looks for running copies of configured executables and adopts them.
    pub async fn scan_external(&self) -> Vec<Adoption> {
        scan::scan(&self.registry).await
    }

    /// Instances of one config, oldest first, after probing adopted processes.
    pub async fn instances(&self, config_id: &str) -> Vec<ProcessInstance> {
        scan::probe(&self.registry).await;
        self.registry.instances_for(config_id).await
    }

    pub async fn instance(&self, instance_id: &str) -> Option<ProcessInstance> {
        self.registry.instance(instance_id).await
    }

    /// Removes stopped and failed instances of `config_id`.
    pub async fn clear_stopped(&self, config_id: &str) -> usize {
        self.registry.clear_stopped(config_id).await
    }

    /// Buffered output of an instance, oldest first.
    pub async fn instance_logs(&self, instance_id: &str) -> Result<Vec<String>> {
        let lines = self.registry.logs(instance_id).await;
        if lines.is_empty() && self.registry.instance(instance_id).await.is_none() {
            return Err(SupervisorError::InstanceNotFound {
                id: instance_id.to_string(),
            });
        }
        Ok(lines)
    }

    pub async fn clear_instance_logs(&self, instance_id: &str) {
        self.registry.clear_logs(instance_id).await;
    }
}

fn spawn_child(config: &AppConfig, env: &HashMap<String, String>) -> Result<Child> {
    let mut command = Command::new(&config.exec_path);
    command
        .args(&config.args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Children outlive the supervisor; a later scan adopts them.
    command.kill_on_drop(false);
    #[cfg(unix)]
    command.process_group(0);

    command
        .spawn()
        .map_err(|source| SupervisorError::LaunchFailed {
            name: config.name.clone(),
            source,
        })
}

/// Copies one output stream into the instance's buffer line by line and
/// publishes each line. Ends when the stream closes.
async fn collect_output<R>(
    registry: Arc<Registry>,
    sink: Arc<dyn LogSink>,
    instance_id: String,
    stream: StreamKind,
    reader: R,
) where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    while let Ok(Some(bytes)) = segments.next_segment().await {
        let line = decode_line(bytes);
        registry.append_log(&instance_id, line.clone()).await;
        sink.publish(LogEvent {
            instance_id: instance_id.clone(),
            stream,
            line,
        });
    }
    debug!(instance = %instance_id, %stream, "output stream closed");
}

/// Owns the child until it exits, serving direct kill requests meanwhile.
async fn monitor_exit(
    registry: Arc<Registry>,
    instance_id: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillReply>,
) {
    let outcome = loop {
        tokio::select! {
            outcome = child.wait() => break outcome,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(child.start_kill());
            }
        }
    };
    registry.record_exit(&instance_id, outcome).await;
}

fn is_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(ESRCH)
}

#[cfg(unix)]
const ESRCH: i32 = libc::ESRCH;
#[cfg(not(unix))]
const ESRCH: i32 = 3;

#[cfg(unix)]
fn kill_group(pid: u32) -> io::Result<()> {
    send_kill(pid, true)
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> io::Result<()> {
    send_kill(pid, false)
}

#[cfg(unix)]
fn send_kill(pid: u32, group: bool) -> io::Result<()> {
    let refuse = |what: String| io::Error::new(io::ErrorKind::InvalidInput, format!("refusing to signal {what}"));
    // Zero and one would reach our own group or every process we may signal.
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 1)
        .ok_or_else(|| refuse(format!("pid {pid}")))?;
    let target = if group {
        // SAFETY: getpgrp has no failure modes.
        if raw == unsafe { libc::getpgrp() } {
            return Err(refuse(format!("own process group {raw}")));
        }
        -raw
    } else {
        raw
    };
    // SAFETY: plain syscall on a validated pid greater than one.
    if unsafe { libc::kill(target, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups are unix-only"))
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "pid signals are unix-only"))
}
