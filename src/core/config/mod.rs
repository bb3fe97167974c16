//! Agent configuration: the connect file read once at boot, and the
//! `AgentConfig` snapshot the master (or a local file) replaces at runtime.
//!
//! The snapshot is swapped atomically behind an `RwLock<Arc<_>>`; readers
//! clone the `Arc` at method entry and never observe a half-installed
//! config. A config that fails validation is discarded and the previous
//! snapshot (and its raw bytes) are kept untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::platform::{NativePlatform, Platform};

pub const LOCAL_AGENT_ID: &str = "local";

const DEFAULT_SPOOL_LIMIT: u64 = 100_000;

fn default_spool_limit() -> u64 {
    DEFAULT_SPOOL_LIMIT
}

/// Process-wide connection settings, read from `configs/agent.conf` at boot.
/// `id == "local"` selects offline mode and no master traffic happens at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub master: String,
    #[serde(default = "default_spool_limit")]
    pub spool_limit: u64,
}

impl ConnectConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("configs").join("agent.conf");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read connect config {}", path.display()))?;
        let config: ConnectConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid connect config {}", path.display()))?;
        if config.id.is_empty() {
            bail!("connect config: 'id' should not be empty");
        }
        if !config.is_local() && config.master.is_empty() {
            bail!("connect config: 'master' should not be empty");
        }
        Ok(config)
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_AGENT_ID
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

impl AgentConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let config: AgentConfig =
            serde_yaml::from_str(raw).context("invalid agent config yaml")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("invalid agent id");
        }
        Ok(())
    }

    /// Look up a task across all apps, enabled or not. Used by the `run`
    /// verb and `RUN_TASK`, which may target tasks that are not scheduled.
    pub fn find_task(&self, task_id: &str) -> Option<(&AppConfig, &TaskConfig)> {
        for app in &self.apps {
            for task in &app.tasks {
                if task.id == task_id {
                    return Some((app, task));
                }
            }
        }
        None
    }

    pub fn task_name(&self, task_id: &str) -> Option<&str> {
        self.find_task(task_id).map(|(_, task)| task.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: String,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Monotonic per task; a change makes the reconciler restart the
    /// executor under the new config.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    /// Cron expression; empty means the task is only runnable on boot or
    /// via `RUN_TASK` / the `run` verb.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: String,
    /// Seconds until a running child is killed; 0 disables the limit.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub on: bool,
    /// Collection period in seconds.
    #[serde(default = "default_item_interval")]
    pub interval: u64,
    /// Shell command whose stdout carries the collected values, ideally a
    /// JSON object; anything else is wrapped under an `output` key.
    #[serde(default)]
    pub collector: String,
}

fn default_item_interval() -> u64 {
    60
}

/// Owns the current `AgentConfig` snapshot and the files under `configs/`.
pub struct ConfigStore {
    dir: PathBuf,
    current: RwLock<Arc<AgentConfig>>,
    raw: RwLock<String>,
}

impl ConfigStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("configs"),
            current: RwLock::new(Arc::new(AgentConfig::default())),
            raw: RwLock::new(String::new()),
        }
    }

    pub fn current(&self) -> Arc<AgentConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.dir.join("agents")
    }

    /// Install a config fetched from the master: parse, validate, persist to
    /// `agents/agent.<id>.conf` and swap the snapshot. On any failure the
    /// previous snapshot stays installed.
    pub fn install(&self, raw: &str) -> Result<Arc<AgentConfig>> {
        let config = AgentConfig::parse(raw)?;
        config.validate()?;

        let agents_dir = self.agents_dir();
        std::fs::create_dir_all(&agents_dir)?;
        let path = agents_dir.join(format!("agent.{}.conf", config.id));
        write_atomic(&path, raw.as_bytes())?;
        NativePlatform::restrict_file_permissions(&path);

        Ok(self.swap(config, raw))
    }

    /// Read `agents/agent.local.conf` once. Returns `Ok(None)` when the file
    /// content has not changed since the last successful load.
    pub fn load_local(&self) -> Result<Option<Arc<AgentConfig>>> {
        let path = self.agents_dir().join("agent.local.conf");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        if !raw.is_empty() && *self.raw.read().expect("config lock poisoned") == raw {
            return Ok(None);
        }
        let config = AgentConfig::parse(&raw)?;
        config.validate()?;
        Ok(Some(self.swap(config, &raw)))
    }

    /// Read a previously installed config without touching the snapshot.
    /// The `run` verb uses this to locate a task outside the daemon.
    pub fn load_installed(root: &Path, agent_id: &str) -> Result<AgentConfig> {
        let path = root
            .join("configs")
            .join("agents")
            .join(format!("agent.{agent_id}.conf"));
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config = AgentConfig::parse(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn swap(&self, config: AgentConfig, raw: &str) -> Arc<AgentConfig> {
        let snapshot = Arc::new(config);
        *self.current.write().expect("config lock poisoned") = snapshot.clone();
        *self.raw.write().expect("config lock poisoned") = raw.to_string();
        snapshot
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("conf.tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("cannot replace {}", path.display()))?;
    Ok(())
}
