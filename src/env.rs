//! Environment construction for spawned processes.
//!
//! GUI-launched supervisors usually miss the PATH entries a terminal session
//! would have, so the inherit policy also merges a filtered set of variables
//! reported by the user's interactive shell.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{AppConfig, Settings};

const IMPORTANT_VARS: &[&str] = &[
    "PATH",
    "NVM_DIR",
    "NVM_BIN",
    "NVM_INC",
    "NVM_CD_FLAGS",
    "NODE_PATH",
    "NODE_ENV",
    "JAVA_HOME",
    "GOPATH",
    "GOROOT",
    "PYTHON_PATH",
    "PYTHONPATH",
    "CARGO_HOME",
    "RUSTUP_HOME",
];

const IMPORTANT_PREFIXES: &[&str] = &["NVM_", "NODE_", "NPM_", "JAVA_", "GO", "PYTHON", "RUST"];

/// Builds the variable set handed to a child process.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    shell: String,
    minimal_path: String,
}

impl EnvBuilder {
    pub fn new(shell: impl Into<String>, minimal_path: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            minimal_path: minimal_path.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.probe_shell(), settings.minimal_path())
    }

    /// Builds the environment for `config`.
    ///
    /// Overrides from the config are applied last and win over everything.
    pub async fn build(&self, config: &AppConfig) -> HashMap<String, String> {
        let mut env = if config.inherit_env {
            let mut env: HashMap<String, String> = std::env::vars().collect();
            self.merge_shell_env(&mut env).await;
            env
        } else {
            self.minimal_env()
        };

        backfill_identity(&mut env);
        env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        debug!(
            app = %config.name,
            inherit = config.inherit_env,
            vars = env.len(),
            path = env.get("PATH").map(String::as_str).unwrap_or(""),
            "built child environment"
        );
        env
    }

    fn minimal_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(home) = dirs::home_dir() {
            env.insert("HOME".to_string(), home.to_string_lossy().into_owned());
        }
        if let Some(user) = std::env::var("USER").ok().filter(|u| !u.is_empty()) {
            env.insert("USER".to_string(), user);
        }
        env.insert("PATH".to_string(), self.minimal_path.clone());
        env
    }

    // Failure here is never fatal; the inherited set is used as-is.
    async fn merge_shell_env(&self, env: &mut HashMap<String, String>) {
        let output = Command::new(&self.shell)
            .args(["-i", "-c", "env"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(shell = %self.shell, status = %output.status, "shell environment probe failed");
                return;
            }
            Err(err) => {
                warn!(shell = %self.shell, error = %err, "could not run shell environment probe");
                return;
            }
        };

        let updated = merge_important(env, &String::from_utf8_lossy(&output.stdout));
        debug!(shell = %self.shell, updated, "merged shell environment");
    }
}

/// Merges `KEY=VALUE` lines whose key is on the allow-list. Returns how many
/// entries changed.
fn merge_important(env: &mut HashMap<String, String>, listing: &str) -> usize {
    let mut updated = 0;
    for line in listing.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !is_important_var(key) {
            continue;
        }
        if env.get(key).map(String::as_str) != Some(value) {
            env.insert(key.to_string(), value.to_string());
            updated += 1;
        }
    }
    updated
}

fn is_important_var(key: &str) -> bool {
    IMPORTANT_VARS.contains(&key) || IMPORTANT_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn backfill_identity(env: &mut HashMap<String, String>) {
    if !env.contains_key("HOME") {
        if let Some(home) = dirs::home_dir() {
            env.insert("HOME".to_string(), home.to_string_lossy().into_owned());
        }
    }
    if !env.contains_key("USER") {
        if let Some(user) = std::env::var("USER").ok().filter(|u| !u.is_empty()) {
            env.insert("USER".to_string(), user);
        }
    }
}
