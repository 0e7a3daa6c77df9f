//! appkeep: a local supervisor for user-defined applications.
//!
//! This is the entry point. It parses command-line arguments, opens the
//! config store and drives the `ProcessManager`, standing in for the
//! graphical shell a desktop build would put in front of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use appkeep::config::{self, AppConfig};
use appkeep::events::{LogBroadcaster, LogEvent};
use appkeep::output::{sanitize_text, StreamKind};
use appkeep::process::InstanceStatus;
use appkeep::registry::StatusSummary;
use appkeep::ProcessManager;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "appkeep", version, about = "Keep local applications running")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Directory holding config.json and settings.toml (default ~/.appkeep).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured applications.
    List,
    /// Add or update an application: add --name api -- /usr/bin/node server.js
    Add {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Existing id to update instead of creating a new entry.
        #[arg(long)]
        id: Option<String>,
        /// Permit several concurrent instances.
        #[arg(long)]
        allow_multi: bool,
        /// Start from a minimal environment instead of inheriting ours.
        #[arg(long)]
        no_inherit_env: bool,
        /// Extra environment entries (KEY=VAL).
        #[arg(long)]
        env: Vec<String>,
        /// Executable followed by its arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Remove an application by id or name.
    Remove { app: String },
    /// Show applications and their instances.
    Status {
        /// Scan the process table for external instances first.
        #[arg(long)]
        scan: bool,
    },
    /// Adopt running processes that match configured executables.
    Scan,
    /// Start applications and stream their output until they exit.
    Run {
        /// Application ids or names.
        #[arg(required = true)]
        apps: Vec<String>,
        /// Strip ANSI escape codes from output.
        #[arg(long)]
        no_color: bool,
    },
    /// Kill every running instance of an application, including external ones.
    Stop { app: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let dir = config::config_dir(cli.config_dir.as_deref());
    let hub = LogBroadcaster::new();
    let manager = ProcessManager::open(&dir, Arc::new(hub.clone()))
        .with_context(|| format!("failed to open config dir {}", dir.display()))?;

    match cli.command {
        Commands::List => {
            for cfg in manager.configs().await {
                println!("{}  {}  {}", cfg.id, cfg.name, format_command(&cfg));
            }
        }
        Commands::Add {
            name,
            id,
            allow_multi,
            no_inherit_env,
            env,
            command,
        } => {
            let mut parts = command.into_iter();
            let exec = parts.next().ok_or_else(|| anyhow!("missing executable"))?;
            let mut cfg = AppConfig::new(name, exec, parts.collect());
            cfg.id = id.unwrap_or_default();
            cfg.allow_multi = allow_multi;
            cfg.inherit_env = !no_inherit_env;
            cfg.env = env
                .iter()
                .map(String::as_str)
                .map(split_env)
                .collect::<Result<HashMap<_, _>>>()?;
            let id = manager.save_config(cfg).await?;
            println!("{id}");
        }
        Commands::Remove { app } => {
            let cfg = resolve_app(&manager, &app).await?;
            manager.delete_config(&cfg.id).await?;
            println!("removed {}", cfg.name);
        }
        Commands::Status { scan } => {
            if scan {
                manager.scan_external().await;
            }
            print_status(&manager.all_status().await);
        }
        Commands::Scan => {
            let adopted = manager.scan_external().await;
            if adopted.is_empty() {
                println!("no new external processes");
            }
            let names: HashMap<String, String> = manager
                .configs()
                .await
                .into_iter()
                .map(|cfg| (cfg.id, cfg.name))
                .collect();
            for adoption in adopted {
                let name = names.get(&adoption.config_id).map_or("?", String::as_str);
                println!("adopted {} pid {} as {}", name, adoption.pid, adoption.instance_id);
            }
        }
        Commands::Run { apps, no_color } => run_apps(&manager, &hub, &apps, no_color).await?,
        Commands::Stop { app } => {
            let cfg = resolve_app(&manager, &app).await?;
            manager.scan_external().await;
            let mut stopped = 0;
            for inst in manager.instances(&cfg.id).await.iter().filter(|i| i.is_running()) {
                manager
                    .stop_instance(&inst.instance_id)
                    .await
                    .with_context(|| format!("failed to stop pid {}", inst.pid))?;
                stopped += 1;
            }
            println!("stopped {stopped} instance(s) of {}", cfg.name);
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Starts `apps`, prints their output prefixed by name, and returns once all
/// of them have exited. Ctrl-C or SIGTERM stops everything that was started.
async fn run_apps(
    manager: &ProcessManager,
    hub: &LogBroadcaster,
    apps: &[String],
    strip_ansi: bool,
) -> Result<()> {
    let mut feed = hub.subscribe_all();
    let mut names: HashMap<String, String> = HashMap::new();
    for app in apps {
        let cfg = resolve_app(manager, app).await?;
        match manager.start_app(&cfg.id).await {
            Ok(instance_id) => {
                names.insert(instance_id, cfg.name);
            }
            Err(err) => warn!(app = %cfg.name, error = %err, "could not start"),
        }
    }
    if names.is_empty() {
        bail!("nothing was started");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut stopping = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            Some(event) = feed.recv() => print_event(&names, &event, strip_ansi),
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                for id in names.keys() {
                    if let Err(err) = manager.stop_instance(id).await {
                        warn!(instance = %id, error = %err, "failed to stop");
                    }
                }
            }
            _ = ticker.tick() => {
                if all_exited(manager, &names).await {
                    break;
                }
            }
        }
    }

    // Collectors may still be flushing the last lines.
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), feed.recv()).await {
        print_event(&names, &event, strip_ansi);
    }
    for (id, name) in &names {
        if let Some(inst) = manager.instance(id).await {
            println!("[{}] {}", name, describe_exit(inst.status, inst.exit_code, inst.error.as_deref()));
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn all_exited(manager: &ProcessManager, names: &HashMap<String, String>) -> bool {
    for id in names.keys() {
        if manager.instance(id).await.map_or(false, |inst| inst.is_running()) {
            return false;
        }
    }
    true
}

fn print_event(names: &HashMap<String, String>, event: &LogEvent, strip_ansi: bool) {
    let Some(name) = names.get(&event.instance_id) else {
        return;
    };
    let line = format!("[{}] {}", name, sanitize_text(&event.line, strip_ansi));
    match event.stream {
        StreamKind::Stdout => println!("{line}"),
        StreamKind::Stderr => eprintln!("{line}"),
    }
}

/// Finds a config by exact id, then by name.
async fn resolve_app(manager: &ProcessManager, key: &str) -> Result<AppConfig> {
    let configs = manager.configs().await;
    if let Some(cfg) = configs.iter().find(|c| c.id == key) {
        return Ok(cfg.clone());
    }
    let mut by_name = configs.into_iter().filter(|c| c.name == key);
    match (by_name.next(), by_name.next()) {
        (Some(cfg), None) => Ok(cfg),
        (Some(_), Some(_)) => bail!("several apps are named {key}; use the id"),
        (None, _) => bail!("no app with id or name {key}"),
    }
}

fn print_status(summaries: &[StatusSummary]) {
    if summaries.is_empty() {
        println!("no applications configured");
        return;
    }
    for summary in summaries {
        let command = summary.config.as_ref().map(format_command).unwrap_or_default();
        println!("{} ({})  {}", summary.display_name(), summary.config_id, command);
        if summary.instances.is_empty() {
            println!("    no instances");
        }
        for inst in &summary.instances {
            println!(
                "    {:<8} pid {:<7} {:<8} started {}  {}",
                format!("{:?}", inst.status).to_lowercase(),
                inst.pid,
                format!("{:?}", inst.source).to_lowercase(),
                inst.start_time.format("%Y-%m-%d %H:%M:%S"),
                inst.instance_id,
            );
            if inst.status != InstanceStatus::Running {
                println!("             {}", describe_exit(inst.status, inst.exit_code, inst.error.as_deref()));
            }
        }
    }
}

fn describe_exit(status: InstanceStatus, code: Option<i32>, error: Option<&str>) -> String {
    match (status, code, error) {
        (InstanceStatus::Running, _, _) => "running".to_string(),
        (InstanceStatus::Failed, _, Some(error)) => format!("failed: {error}"),
        (InstanceStatus::Failed, _, None) => "failed".to_string(),
        (InstanceStatus::Stopped, Some(code), _) => format!("exited with {code}"),
        (InstanceStatus::Stopped, None, _) => "exited".to_string(),
    }
}

fn format_command(cfg: &AppConfig) -> String {
    std::iter::once(cfg.exec_path.as_str())
        .chain(cfg.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_env(value: &str) -> Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid env {}, expected KEY=VALUE", value))?;
    if key.is_empty() {
        bail!("invalid env {}, empty key", value);
    }
    Ok((key.to_string(), val.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_command_takes_trailing_args() {
        let cli = Cli::try_parse_from([
            "appkeep", "add", "--name", "api", "--env", "A=1", "--", "/usr/bin/node", "server.js",
            "--port", "80",
        ])
        .unwrap();
        let Commands::Add { name, env, command, .. } = cli.command else {
            panic!("expected add");
        };
        assert_eq!(name, "api");
        assert_eq!(env, vec!["A=1"]);
        assert_eq!(command, vec!["/usr/bin/node", "server.js", "--port", "80"]);
    }

    #[test]
    fn split_env_requires_key_and_value() {
        assert_eq!(split_env("A=b=c").unwrap(), ("A".to_string(), "b=c".to_string()));
        assert!(split_env("novalue").is_err());
        assert!(split_env("=x").is_err());
    }

    #[test]
    fn describe_exit_covers_states() {
        assert_eq!(describe_exit(InstanceStatus::Stopped, Some(0), None), "exited with 0");
        assert_eq!(
            describe_exit(InstanceStatus::Failed, None, Some("wait failed: boom")),
            "failed: wait failed: boom"
        );
    }

    #[test]
    fn format_command_joins_args() {
        let cfg = AppConfig::new("x", "/bin/echo", vec!["a".into(), "b".into()]);
        assert_eq!(format_command(&cfg), "/bin/echo a b");
    }

    #[tokio::test]
    async fn resolve_app_by_id_or_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::open(dir.path(), Arc::new(LogBroadcaster::new())).unwrap();
        let id = manager
            .save_config(AppConfig::new("api", "/bin/true", Vec::new()))
            .await
            .unwrap();
        assert_eq!(resolve_app(&manager, &id).await.unwrap().name, "api");
        assert_eq!(resolve_app(&manager, "api").await.unwrap().id, id);
        assert!(resolve_app(&manager, "web").await.is_err());

        manager
            .save_config(AppConfig::new("api", "/bin/false", Vec::new()))
            .await
            .unwrap();
        assert!(resolve_app(&manager, "api").await.is_err());
    }
}
