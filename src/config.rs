//! Configuration management for appkeep.
//!
//! This module defines the application definitions (`AppConfig`) persisted in
//! `config.json`, the on-disk store that keeps them, and the optional
//! `settings.toml` that tunes the supervisor itself.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// File holding the application definitions, keyed by id.
pub const CONFIG_FILE: &str = "config.json";
/// Optional supervisor settings.
pub const SETTINGS_FILE: &str = "settings.toml";
/// Overrides the config directory when set.
pub const CONFIG_DIR_ENV: &str = "APPKEEP_CONFIG_DIR";

pub const DEFAULT_MAX_LOG_LINES: usize = 1000;
pub const DEFAULT_PROBE_SHELL: &str = "bash";
pub const DEFAULT_MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A logical application: what to run, independent of any particular run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Stable identifier. Empty means "assign one on save".
    #[serde(default)]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Executable to spawn.
    pub exec_path: String,
    /// Arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Permit more than one concurrently running instance.
    #[serde(default)]
    pub allow_multi: bool,
    /// Extra or overriding environment variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Start from the supervisor's environment instead of a minimal one.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
}

fn default_inherit_env() -> bool {
    true
}

impl AppConfig {
    pub fn new(name: impl Into<String>, exec_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            exec_path: exec_path.into(),
            args,
            allow_multi: false,
            env: HashMap::new(),
            inherit_env: default_inherit_env(),
        }
    }
}

/// Supervisor tuning loaded from `settings.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Lines retained per instance.
    pub max_log_lines: Option<usize>,
    /// Shell used to read the interactive environment.
    pub probe_shell: Option<String>,
    /// PATH given to children that do not inherit the environment.
    pub minimal_path: Option<String>,
}

impl Settings {
    pub fn max_log_lines(&self) -> usize {
        self.max_log_lines.unwrap_or(DEFAULT_MAX_LOG_LINES).max(1)
    }

    pub fn probe_shell(&self) -> &str {
        self.probe_shell.as_deref().unwrap_or(DEFAULT_PROBE_SHELL)
    }

    pub fn minimal_path(&self) -> &str {
        self.minimal_path.as_deref().unwrap_or(DEFAULT_MINIMAL_PATH)
    }
}

/// Resolves the per-user config directory: explicit override, then
/// `$APPKEEP_CONFIG_DIR`, then `~/.appkeep`.
pub fn config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".appkeep")
}

/// Loads `settings.toml` from `dir`. A missing file yields defaults.
pub fn load_settings(dir: &Path) -> Result<Settings> {
    let path = dir.join(SETTINGS_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => return Err(persist_error(&path, err)),
    };
    toml::from_str(&raw).map_err(|err| persist_error(&path, err))
}

/// JSON file holding the full set of application definitions.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/config.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every stored config. A missing file is an empty set.
    pub fn load(&self) -> Result<HashMap<String, AppConfig>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(persist_error(&self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let mut configs: HashMap<String, AppConfig> =
            serde_json::from_str(&raw).map_err(|err| persist_error(&self.path, err))?;
        // The map key is authoritative for files edited by hand.
        for (id, config) in configs.iter_mut() {
            if config.id != *id {
                config.id = id.clone();
            }
        }
        Ok(configs)
    }

    /// Rewrites the file with the given set, sorted by id.
    pub fn save(&self, configs: &HashMap<String, AppConfig>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| persist_error(&self.path, err))?;
            }
        }
        let sorted: BTreeMap<&String, &AppConfig> = configs.iter().collect();
        let data =
            serde_json::to_string_pretty(&sorted).map_err(|err| persist_error(&self.path, err))?;
        fs::write(&self.path, data).map_err(|err| persist_error(&self.path, err))
    }
}

fn persist_error(path: &Path, err: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::Persist {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_config_file() {
        let raw = r#"{
  "a1": {
    "id": "a1",
    "name": "api",
    "execPath": "/usr/bin/node",
    "args": ["server.js", "--port", "8080"],
    "allowMulti": true,
    "env": {"NODE_ENV": "production"},
    "inheritEnv": false
  },
  "b2": {
    "name": "worker",
    "execPath": "/opt/worker"
  }
}"#;
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        fs::write(store.path(), raw).unwrap();

        let configs = store.load().unwrap();
        assert_eq!(configs.len(), 2);
        let api = &configs["a1"];
        assert_eq!(api.exec_path, "/usr/bin/node");
        assert_eq!(api.args, vec!["server.js", "--port", "8080"]);
        assert!(api.allow_multi);
        assert!(!api.inherit_env);
        assert_eq!(api.env.get("NODE_ENV").map(String::as_str), Some("production"));

        let worker = &configs["b2"];
        assert_eq!(worker.id, "b2");
        assert!(worker.args.is_empty());
        assert!(!worker.allow_multi);
        assert!(worker.inherit_env);
        assert_eq!(worker.inherit_env, AppConfig::new("w", "/opt/worker", vec![]).inherit_env);
    }

    #[test]
    fn save_then_load_keeps_every_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join(CONFIG_FILE));
        let mut configs = HashMap::new();
        let mut cfg = AppConfig::new("sleeper", "/bin/sleep", vec!["5".into()]);
        cfg.id = "x".into();
        configs.insert(cfg.id.clone(), cfg.clone());

        store.save(&configs).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"execPath\""));
        assert!(!raw.contains("\"env\""));
        assert_eq!(store.load().unwrap(), configs);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(SupervisorError::Persist { .. })));
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_log_lines(), DEFAULT_MAX_LOG_LINES);
        assert_eq!(settings.probe_shell(), "bash");

        fs::write(
            dir.path().join(SETTINGS_FILE),
            "max_log_lines = 50\nprobe_shell = \"zsh\"\nminimal_path = \"/bin\"\n",
        )
        .unwrap();
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_log_lines(), 50);
        assert_eq!(settings.probe_shell(), "zsh");
        assert_eq!(settings.minimal_path(), "/bin");
    }

    #[test]
    fn explicit_config_dir_wins() {
        let dir = config_dir(Some(Path::new("/tmp/appkeep-test")));
        assert_eq!(dir, PathBuf::from("/tmp/appkeep-test"));
    }
}
