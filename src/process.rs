//! Data structures for tracking process instances.
//!
//! A tracked instance is either one this supervisor launched, which owns a
//! channel to the task holding its `Child`, or one adopted from the process
//! table, which is known only by PID. `ProcessInstance` is the plain snapshot
//! handed out to callers.

use std::io;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// The current lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Process is alive.
    Running,
    /// Process exited or was killed; the exit code is recorded.
    Stopped,
    /// Waiting on or probing the process failed; see the error text.
    Failed,
}

/// Where an instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    /// Spawned by this supervisor.
    Launched,
    /// Discovered running in the process table.
    External,
}

/// Reply channel for a kill request sent to a lifecycle monitor.
pub type KillReply = oneshot::Sender<io::Result<()>>;

/// Handle to a launched process. The `Child` itself lives in its lifecycle
/// monitor task; kill requests are forwarded there.
#[derive(Debug, Clone)]
pub struct LaunchedHandle {
    kill_tx: mpsc::Sender<KillReply>,
}

impl LaunchedHandle {
    pub fn new(kill_tx: mpsc::Sender<KillReply>) -> Self {
        Self { kill_tx }
    }

    /// Kills just the owned child, bypassing its process group.
    pub async fn kill(&self) -> io::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let gone = || io::Error::new(io::ErrorKind::NotFound, "process already reaped");
        self.kill_tx.send(reply_tx).await.map_err(|_| gone())?;
        reply_rx.await.map_err(|_| gone())?
    }
}

/// Capabilities that depend on how an instance was obtained.
#[derive(Debug, Clone)]
pub enum InstanceKind {
    Launched(LaunchedHandle),
    External,
}

impl InstanceKind {
    pub fn source(&self) -> InstanceSource {
        match self {
            InstanceKind::Launched(_) => InstanceSource::Launched,
            InstanceKind::External => InstanceSource::External,
        }
    }
}

/// Snapshot of one concrete run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub instance_id: String,
    pub pid: u32,
    pub config_id: String,
    pub status: InstanceStatus,
    pub source: InstanceSource,
    pub start_time: DateTime<Local>,
    /// Set once the process has terminated.
    pub exit_code: Option<i32>,
    /// Populated only when `status` is `Failed`.
    pub error: Option<String>,
}

impl ProcessInstance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Registry entry: the snapshot data plus what the supervisor can do with it.
#[derive(Debug)]
pub struct TrackedInstance {
    pub info: ProcessInstance,
    pub kind: InstanceKind,
}

impl TrackedInstance {
    pub fn launched(config_id: &str, pid: u32, handle: LaunchedHandle) -> Self {
        Self::running(config_id, pid, InstanceKind::Launched(handle))
    }

    pub fn external(config_id: &str, pid: u32) -> Self {
        Self::running(config_id, pid, InstanceKind::External)
    }

    fn running(config_id: &str, pid: u32, kind: InstanceKind) -> Self {
        Self {
            info: ProcessInstance {
                instance_id: uuid::Uuid::new_v4().to_string(),
                pid,
                config_id: config_id.to_string(),
                status: InstanceStatus::Running,
                source: kind.source(),
                start_time: Local::now(),
                exit_code: None,
                error: None,
            },
            kind,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.instance_id
    }

    pub fn is_running(&self) -> bool {
        self.info.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_instances_get_distinct_ids() {
        let a = TrackedInstance::external("cfg", 10);
        let b = TrackedInstance::external("cfg", 10);
        assert_ne!(a.id(), b.id());
        assert!(a.is_running());
        assert_eq!(a.info.source, InstanceSource::External);
    }

    #[test]
    fn snapshot_serializes_lowercase_enums() {
        let inst = TrackedInstance::external("cfg", 42);
        let json = serde_json::to_value(&inst.info).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["source"], "external");
        assert_eq!(json["configId"], "cfg");
        assert_eq!(json["pid"], 42);
    }

    #[tokio::test]
    async fn kill_on_reaped_handle_reports_not_found() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = LaunchedHandle::new(tx);
        let err = handle.kill().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
