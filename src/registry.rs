//! The supervisor's in-memory source of truth.
//!
//! Configs, instances and log buffers sit behind one reader/writer lock. Only
//! whole operations are exposed (check-and-insert, record-exit, probe-all) so
//! no caller ever holds a reference to an entry outside the lock.

use std::collections::{HashMap, HashSet};
use std::io;
use std::process::ExitStatus;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigStore};
use crate::error::{Result, SupervisorError};
use crate::output::LogBuffer;
use crate::process::{InstanceKind, InstanceSource, InstanceStatus, ProcessInstance, TrackedInstance};
use crate::scan::Liveness;

/// One config with its instances. `config` is `None` for instances whose
/// config has since been deleted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub config_id: String,
    pub config: Option<AppConfig>,
    pub instances: Vec<ProcessInstance>,
}

impl StatusSummary {
    pub fn display_name(&self) -> &str {
        self.config
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("(unknown app)")
    }
}

/// What `stop` needs to signal a running instance.
#[derive(Debug, Clone)]
pub struct StopTarget {
    pub pid: u32,
    pub config_id: String,
    pub kind: InstanceKind,
}

#[derive(Default)]
struct State {
    configs: HashMap<String, AppConfig>,
    instances: HashMap<String, TrackedInstance>,
    logs: HashMap<String, LogBuffer>,
}

impl State {
    fn has_running(&self, config_id: &str) -> bool {
        self.instances
            .values()
            .any(|inst| inst.info.config_id == config_id && inst.is_running())
    }
}

pub struct Registry {
    state: RwLock<State>,
    /// Serializes config edits so the state lock is free while the file is written.
    save_lock: Mutex<()>,
    store: ConfigStore,
    max_log_lines: usize,
}

impl Registry {
    /// Opens the registry, loading persisted configs from `store`.
    pub fn open(store: ConfigStore, max_log_lines: usize) -> Result<Self> {
        let configs = store.load()?;
        debug!(path = %store.path().display(), count = configs.len(), "loaded configs");
        Ok(Self {
            state: RwLock::new(State {
                configs,
                ..State::default()
            }),
            save_lock: Mutex::new(()),
            store,
            max_log_lines,
        })
    }

    /// All configs, sorted by name.
    pub async fn configs(&self) -> Vec<AppConfig> {
        let state = self.state.read().await;
        let mut configs: Vec<AppConfig> = state.configs.values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        configs
    }

    pub async fn config(&self, id: &str) -> Option<AppConfig> {
        self.state.read().await.configs.get(id).cloned()
    }

    /// Inserts or replaces a config, assigning a fresh id when it has none.
    /// The store is rewritten before the change becomes visible.
    pub async fn upsert_config(&self, mut config: AppConfig) -> Result<String> {
        if config.id.is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        let id = config.id.clone();
        let _saving = self.save_lock.lock().await;
        let mut next = self.state.read().await.configs.clone();
        next.insert(id.clone(), config);
        let next = self.persist(next).await?;
        self.state.write().await.configs = next;
        Ok(id)
    }

    /// Removes a config. Its instances stay, now pointing at a missing id.
    pub async fn delete_config(&self, id: &str) -> Result<bool> {
        let _saving = self.save_lock.lock().await;
        let mut next = self.state.read().await.configs.clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        let next = self.persist(next).await?;
        self.state.write().await.configs = next;
        Ok(true)
    }

    /// Writes `configs` to the store on the blocking pool and hands them back.
    async fn persist(&self, configs: HashMap<String, AppConfig>) -> Result<HashMap<String, AppConfig>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&configs).map(|()| configs))
            .await
            .map_err(|err| SupervisorError::Persist {
                path: self.store.path().to_path_buf(),
                message: err.to_string(),
            })?
    }

    /// Runs `spawn` and registers the instance it produces, all under the
    /// write lock so two concurrent starts cannot both pass the single
    /// instance check. `spawn` must not block.
    pub async fn insert_exclusive<R>(
        &self,
        config: &AppConfig,
        spawn: impl FnOnce() -> Result<(TrackedInstance, R)>,
    ) -> Result<R> {
        let mut state = self.state.write().await;
        let Some(current) = state.configs.get(&config.id) else {
            return Err(SupervisorError::ConfigNotFound {
                id: config.id.clone(),
            });
        };
        if !current.allow_multi && state.has_running(&config.id) {
            return Err(SupervisorError::AlreadyRunning {
                name: config.name.clone(),
            });
        }
        let (instance, extra) = spawn()?;
        state.instances.insert(instance.id().to_string(), instance);
        Ok(extra)
    }

    /// Registers `pid` as an external instance of `config_id` unless it is
    /// already tracked as running for that config.
    pub async fn adopt(&self, config_id: &str, pid: u32) -> Option<String> {
        let mut state = self.state.write().await;
        let known = state.instances.values().any(|inst| {
            inst.info.config_id == config_id && inst.info.pid == pid && inst.is_running()
        });
        if known {
            return None;
        }
        let instance = TrackedInstance::external(config_id, pid);
        let id = instance.id().to_string();
        state.instances.insert(id.clone(), instance);
        Some(id)
    }

    /// PIDs of running instances of `config_id`.
    pub async fn running_pids(&self, config_id: &str) -> HashSet<u32> {
        self.state
            .read()
            .await
            .instances
            .values()
            .filter(|inst| inst.info.config_id == config_id && inst.is_running())
            .map(|inst| inst.info.pid)
            .collect()
    }

    /// Records how a launched instance's wait ended.
    pub async fn record_exit(&self, instance_id: &str, outcome: io::Result<ExitStatus>) {
        let mut state = self.state.write().await;
        let Some(inst) = state.instances.get_mut(instance_id) else {
            return;
        };
        match outcome {
            Ok(status) => {
                let code = exit_code_of(status);
                inst.info.status = InstanceStatus::Stopped;
                inst.info.exit_code = Some(code);
                info!(instance = instance_id, pid = inst.info.pid, code, "process exited");
            }
            Err(err) => {
                let err = SupervisorError::WaitFailed {
                    message: err.to_string(),
                };
                inst.info.status = InstanceStatus::Failed;
                inst.info.error = Some(err.to_string());
                warn!(instance = instance_id, pid = inst.info.pid, error = %err, "process wait failed");
            }
        }
    }

    /// Applies `probe` to every running external instance and records deaths.
    /// Returns how many instances changed state.
    pub async fn probe_external(&self, probe: impl Fn(u32) -> Liveness) -> usize {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for inst in state.instances.values_mut() {
            if inst.info.source != InstanceSource::External || !inst.is_running() {
                continue;
            }
            if apply_liveness(inst, probe(inst.info.pid)) {
                changed += 1;
            }
        }
        changed
    }

    /// Records a single liveness result for a running external instance.
    pub async fn record_liveness(&self, instance_id: &str, liveness: Liveness) -> bool {
        let mut state = self.state.write().await;
        match state.instances.get_mut(instance_id) {
            Some(inst) if inst.info.source == InstanceSource::External && inst.is_running() => {
                apply_liveness(inst, liveness)
            }
            _ => false,
        }
    }

    pub async fn instance(&self, instance_id: &str) -> Option<ProcessInstance> {
        self.state
            .read()
            .await
            .instances
            .get(instance_id)
            .map(|inst| inst.info.clone())
    }

    /// Returns how to signal `instance_id`, or `None` if it is not running.
    pub async fn stop_target(&self, instance_id: &str) -> Result<Option<StopTarget>> {
        let state = self.state.read().await;
        let inst = state
            .instances
            .get(instance_id)
            .ok_or_else(|| SupervisorError::InstanceNotFound {
                id: instance_id.to_string(),
            })?;
        if !inst.is_running() {
            return Ok(None);
        }
        Ok(Some(StopTarget {
            pid: inst.info.pid,
            config_id: inst.info.config_id.clone(),
            kind: inst.kind.clone(),
        }))
    }

    /// Instances of one config, oldest first.
    pub async fn instances_for(&self, config_id: &str) -> Vec<ProcessInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<ProcessInstance> = state
            .instances
            .values()
            .filter(|inst| inst.info.config_id == config_id)
            .map(|inst| inst.info.clone())
            .collect();
        sort_by_start(&mut instances);
        instances
    }

    pub async fn running_instances(&self) -> Vec<ProcessInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<ProcessInstance> = state
            .instances
            .values()
            .filter(|inst| inst.is_running())
            .map(|inst| inst.info.clone())
            .collect();
        sort_by_start(&mut instances);
        instances
    }

    /// Every config with its instances, followed by groups for deleted configs.
    pub async fn summaries(&self) -> Vec<StatusSummary> {
        let state = self.state.read().await;
        let mut grouped: HashMap<&str, Vec<ProcessInstance>> = HashMap::new();
        for inst in state.instances.values() {
            grouped
                .entry(inst.info.config_id.as_str())
                .or_default()
                .push(inst.info.clone());
        }

        let mut configs: Vec<&AppConfig> = state.configs.values().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        let mut summaries: Vec<StatusSummary> = configs
            .into_iter()
            .map(|cfg| {
                let mut instances = grouped.remove(cfg.id.as_str()).unwrap_or_default();
                sort_by_start(&mut instances);
                StatusSummary {
                    config_id: cfg.id.clone(),
                    config: Some(cfg.clone()),
                    instances,
                }
            })
            .collect();

        let mut dangling: Vec<(&str, Vec<ProcessInstance>)> = grouped.into_iter().collect();
        dangling.sort_by(|a, b| a.0.cmp(b.0));
        for (config_id, mut instances) in dangling {
            sort_by_start(&mut instances);
            summaries.push(StatusSummary {
                config_id: config_id.to_string(),
                config: None,
                instances,
            });
        }
        summaries
    }

    /// Drops stopped and failed instances of `config_id`. Running ones stay.
    pub async fn clear_stopped(&self, config_id: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.instances.len();
        state
            .instances
            .retain(|_, inst| inst.info.config_id != config_id || inst.is_running());
        before - state.instances.len()
    }

    /// Appends a line to an instance's buffer, creating it on first use.
    pub async fn append_log(&self, instance_id: &str, line: String) {
        let mut state = self.state.write().await;
        let max_lines = self.max_log_lines;
        state
            .logs
            .entry(instance_id.to_string())
            .or_insert_with(|| LogBuffer::new(max_lines))
            .push(line);
    }

    /// Buffered lines for an instance, oldest first.
    pub async fn logs(&self, instance_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .logs
            .get(instance_id)
            .map(LogBuffer::to_vec)
            .unwrap_or_default()
    }

    pub async fn clear_logs(&self, instance_id: &str) {
        self.state.write().await.logs.remove(instance_id);
    }
}

fn apply_liveness(inst: &mut TrackedInstance, liveness: Liveness) -> bool {
    match liveness {
        Liveness::Alive => return false,
        Liveness::Gone => {
            inst.info.status = InstanceStatus::Stopped;
            inst.info.exit_code = Some(0);
        }
        Liveness::Unresolvable(reason) => {
            inst.info.status = InstanceStatus::Failed;
            inst.info.error = Some(reason);
        }
    }
    debug!(instance = %inst.info.instance_id, pid = inst.info.pid, status = ?inst.info.status, "external instance ended");
    true
}

fn sort_by_start(instances: &mut [ProcessInstance]) {
    instances.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
}

/// Numeric exit code; signal deaths are reported shell-style as 128 + signal.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(ConfigStore::in_dir(dir.path()), 3).unwrap();
        (dir, registry)
    }

    fn sleeper(allow_multi: bool) -> AppConfig {
        let mut cfg = AppConfig::new("sleeper", "/bin/sleep", vec!["5".into()]);
        cfg.allow_multi = allow_multi;
        cfg
    }

    #[tokio::test]
    async fn upsert_assigns_stable_id_and_persists() {
        let (dir, registry) = registry();
        let id = registry.upsert_config(sleeper(false)).await.unwrap();
        assert!(!id.is_empty());

        let mut edited = registry.config(&id).await.unwrap();
        edited.name = "renamed".into();
        assert_eq!(registry.upsert_config(edited).await.unwrap(), id);

        let reopened = Registry::open(ConfigStore::in_dir(dir.path()), 3).unwrap();
        let configs = reopened.configs().await;
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, id);
        assert_eq!(configs[0].name, "renamed");
    }

    #[tokio::test]
    async fn concurrent_upserts_are_all_persisted() {
        let (dir, registry) = registry();
        let (a, b) = tokio::join!(
            registry.upsert_config(sleeper(false)),
            registry.upsert_config(sleeper(true))
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);

        let reopened = Registry::open(ConfigStore::in_dir(dir.path()), 3).unwrap();
        let ids: HashSet<String> = reopened.configs().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, HashSet::from([a, b]));
    }

    #[tokio::test]
    async fn failed_save_leaves_configs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let registry = Registry::open(ConfigStore::in_dir(&nested), 3).unwrap();
        // A plain file where the config directory should be.
        std::fs::write(&nested, "").unwrap();

        let result = registry.upsert_config(sleeper(false)).await;
        assert!(matches!(result, Err(SupervisorError::Persist { .. })));
        assert!(registry.configs().await.is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_instances_as_dangling() {
        let (_dir, registry) = registry();
        let id = registry.upsert_config(sleeper(false)).await.unwrap();
        registry.adopt(&id, 4242).await.unwrap();

        assert!(registry.delete_config(&id).await.unwrap());
        assert!(!registry.delete_config(&id).await.unwrap());
        assert!(registry.configs().await.is_empty());

        let summaries = registry.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].config.is_none());
        assert_eq!(summaries[0].display_name(), "(unknown app)");
        assert_eq!(summaries[0].instances[0].pid, 4242);
    }

    #[tokio::test]
    async fn exclusive_insert_rejects_second_running_instance() {
        let (_dir, registry) = registry();
        let mut cfg = sleeper(false);
        cfg.id = registry.upsert_config(cfg.clone()).await.unwrap();

        let first = registry
            .insert_exclusive(&cfg, || Ok((TrackedInstance::external(&cfg.id, 1), ())))
            .await;
        assert!(first.is_ok());
        let second = registry
            .insert_exclusive(&cfg, || Ok((TrackedInstance::external(&cfg.id, 2), ())))
            .await;
        assert!(matches!(second, Err(SupervisorError::AlreadyRunning { .. })));
        assert_eq!(registry.running_pids(&cfg.id).await, HashSet::from([1]));
    }

    #[tokio::test]
    async fn exclusive_insert_allows_multi() {
        let (_dir, registry) = registry();
        let mut cfg = sleeper(true);
        cfg.id = registry.upsert_config(cfg.clone()).await.unwrap();
        for pid in [1, 2] {
            registry
                .insert_exclusive(&cfg, || Ok((TrackedInstance::external(&cfg.id, pid), ())))
                .await
                .unwrap();
        }
        assert_eq!(registry.running_pids(&cfg.id).await.len(), 2);
    }

    #[tokio::test]
    async fn exclusive_insert_needs_existing_config() {
        let (_dir, registry) = registry();
        let mut cfg = sleeper(false);
        cfg.id = "missing".into();
        let result = registry
            .insert_exclusive(&cfg, || Ok((TrackedInstance::external("missing", 1), ())))
            .await;
        assert!(matches!(result, Err(SupervisorError::ConfigNotFound { .. })));
    }

    #[tokio::test]
    async fn adopt_skips_known_running_pid() {
        let (_dir, registry) = registry();
        assert!(registry.adopt("cfg", 77).await.is_some());
        assert!(registry.adopt("cfg", 77).await.is_none());
        assert!(registry.adopt("other", 77).await.is_some());
    }

    #[tokio::test]
    async fn probe_transitions_external_instances() {
        let (_dir, registry) = registry();
        let alive = registry.adopt("cfg", 1).await.unwrap();
        let gone = registry.adopt("cfg", 2).await.unwrap();
        let broken = registry.adopt("cfg", 3).await.unwrap();

        let changed = registry
            .probe_external(|pid| match pid {
                1 => Liveness::Alive,
                2 => Liveness::Gone,
                _ => Liveness::Unresolvable("process not found".into()),
            })
            .await;
        assert_eq!(changed, 2);

        assert!(registry.instance(&alive).await.unwrap().is_running());
        let gone = registry.instance(&gone).await.unwrap();
        assert_eq!(gone.status, InstanceStatus::Stopped);
        assert_eq!(gone.exit_code, Some(0));
        let broken = registry.instance(&broken).await.unwrap();
        assert_eq!(broken.status, InstanceStatus::Failed);
        assert_eq!(broken.error.as_deref(), Some("process not found"));
    }

    #[tokio::test]
    async fn clear_stopped_keeps_running() {
        let (_dir, registry) = registry();
        let running = registry.adopt("cfg", 1).await.unwrap();
        registry.adopt("cfg", 2).await.unwrap();
        let other = registry.adopt("other", 2).await.unwrap();
        registry
            .probe_external(|pid| if pid == 2 { Liveness::Gone } else { Liveness::Alive })
            .await;

        assert_eq!(registry.clear_stopped("cfg").await, 1);
        let left = registry.instances_for("cfg").await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id, running);
        assert!(registry.instance(&other).await.is_some());
    }

    #[tokio::test]
    async fn stop_target_reports_missing_and_idle() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.stop_target("nope").await,
            Err(SupervisorError::InstanceNotFound { .. })
        ));
        let id = registry.adopt("cfg", 9).await.unwrap();
        assert_eq!(registry.stop_target(&id).await.unwrap().map(|t| t.pid), Some(9));
        registry.probe_external(|_| Liveness::Gone).await;
        assert!(registry.stop_target(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_liveness_result_only_touches_running_external() {
        let (_dir, registry) = registry();
        let id = registry.adopt("cfg", 9).await.unwrap();
        assert!(!registry.record_liveness(&id, Liveness::Alive).await);
        assert!(registry.record_liveness(&id, Liveness::Gone).await);
        assert!(!registry.record_liveness(&id, Liveness::Gone).await);
        assert!(!registry.record_liveness("nope", Liveness::Gone).await);

        let inst = registry.instance(&id).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert_eq!(inst.exit_code, Some(0));
    }

    #[tokio::test]
    async fn logs_are_bounded_and_clearable() {
        let (_dir, registry) = registry();
        for line in ["a", "b", "c", "d"] {
            registry.append_log("i1", line.to_string()).await;
        }
        assert_eq!(registry.logs("i1").await, vec!["b", "c", "d"]);

        registry.clear_logs("i1").await;
        assert!(registry.logs("i1").await.is_empty());
        registry.append_log("i1", "e".to_string()).await;
        assert_eq!(registry.logs("i1").await, vec!["e"]);
        assert!(registry.logs("unknown").await.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_maps_to_shell_code() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
    }
}
