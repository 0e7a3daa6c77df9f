//! Error types for supervisor operations.
//!
//! Synchronous operations (start, stop, config edits) return these directly.
//! `WaitFailed` never reaches a caller: the lifecycle monitor records its text
//! into the instance instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Start requested for an unknown config id.
    #[error("config not found: {id}")]
    ConfigNotFound { id: String },

    /// Multi-instance is disallowed and an instance is already running.
    #[error("{name} is already running and multi-instance is not allowed")]
    AlreadyRunning { name: String },

    /// The OS refused to spawn the executable.
    #[error("failed to launch {name}: {source}")]
    LaunchFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Stop or log lookup for an unknown instance id.
    #[error("instance not found: {id}")]
    InstanceNotFound { id: String },

    /// Neither the process-group signal nor the fallback reached the process.
    #[error("failed to stop pid {pid}: {message}")]
    StopFailed { pid: u32, message: String },

    /// Abnormal termination observed while waiting on a launched process.
    #[error("wait failed: {message}")]
    WaitFailed { message: String },

    /// The config store could not be read, parsed or written.
    #[error("config store {}: {message}", path.display())]
    Persist { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failed_keeps_cause() {
        let err = SupervisorError::LaunchFailed {
            name: "api".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "failed to launch api: no such file");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn persist_error_mentions_path() {
        let err = SupervisorError::Persist {
            path: PathBuf::from("/tmp/config.json"),
            message: "denied".into(),
        };
        assert_eq!(err.to_string(), "config store /tmp/config.json: denied");
    }
}
