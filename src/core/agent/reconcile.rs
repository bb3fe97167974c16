//! Reconciliation: make the set of running executors match the desired set
//! derived from the current config snapshot.
//!
//! Tasks restart only when their `version` changed; items restart on every
//! pass. Each map serializes on its own lock, so reconciliation is safe to
//! trigger concurrently from the event loop and from a config refetch.

use std::collections::HashSet;

use tracing::{error, info};

use super::Agent;
use crate::core::config::{ItemConfig, TaskConfig};
use crate::core::executor::{ItemExecutor, TaskExecutor, TaskRunner};

impl Agent {
    pub async fn reconcile(&self) {
        self.reconcile_tasks().await;
        self.reconcile_items().await;
    }

    /// Run every boot-tagged task once, without installing a schedule.
    /// Called exactly once at startup, before the first reconciliation.
    pub fn boot_tasks(&self) {
        let config = self.config();
        if !config.on {
            return;
        }
        for app in config.apps.iter().filter(|app| app.on) {
            for task in app.tasks.iter().filter(|task| task.on && task.boot) {
                info!("boot task {} {}", task.id, task.name);
                let runner = TaskRunner::new(
                    &app.id,
                    &config.id,
                    task.clone(),
                    &self.script_dir(),
                    self.events(),
                );
                tokio::spawn(async move {
                    runner.run_once().await;
                });
            }
        }
    }

    pub async fn reconcile_tasks(&self) {
        let config = self.config();
        let mut desired: Vec<(String, TaskConfig)> = Vec::new();
        if config.on {
            for app in config.apps.iter().filter(|app| app.on) {
                for task in app
                    .tasks
                    .iter()
                    .filter(|task| task.on && !task.schedule.trim().is_empty())
                {
                    desired.push((app.id.clone(), task.clone()));
                }
            }
        }
        let desired_ids: HashSet<String> =
            desired.iter().map(|(_, task)| task.id.clone()).collect();

        let mut tasks = self.tasks.lock().await;

        // Stop everything the new config no longer wants.
        let stale: Vec<String> = tasks
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut executor) = tasks.remove(&id) {
                info!("stop schedule task {} {}", id, executor.config().name);
                executor.stop(&self.scheduler).await;
                executor.delete_script();
            }
        }

        for (app_id, task_config) in desired {
            let running_version = tasks
                .get(&task_config.id)
                .map(|executor| executor.config().version);
            match running_version {
                // Same version: leave the running executor untouched.
                Some(version) if version == task_config.version => continue,
                Some(_) => {
                    let mut old = tasks.remove(&task_config.id).expect("present above");
                    info!(
                        "restart schedule task {} {}",
                        task_config.id, task_config.name
                    );
                    old.stop(&self.scheduler).await;
                }
                None => info!("schedule task {} {}", task_config.id, task_config.name),
            }

            let mut executor = TaskExecutor::new(
                &app_id,
                &config.id,
                task_config,
                &self.script_dir(),
                self.events(),
            );
            if let Err(e) = executor.write_script() {
                error!(
                    "cannot generate script for task {}: {e:#}",
                    executor.config().id
                );
            }
            match executor.schedule(&self.scheduler).await {
                Ok(()) => {
                    tasks.insert(executor.config().id.clone(), executor);
                }
                Err(e) => error!("{e:#}"),
            }
        }
        drop(tasks);

        self.sweep_orphan_scripts(&desired_ids);
    }

    /// Items are cheap to restart and their interval must be honored from a
    /// clean slate, so every desired item is stopped and started fresh.
    pub async fn reconcile_items(&self) {
        let config = self.config();
        let mut desired: Vec<(String, ItemConfig)> = Vec::new();
        if config.on {
            for app in config.apps.iter().filter(|app| app.on) {
                for item in app.items.iter().filter(|item| item.on) {
                    desired.push((app.id.clone(), item.clone()));
                }
            }
        }
        let desired_ids: HashSet<String> =
            desired.iter().map(|(_, item)| item.id.clone()).collect();

        let mut items = self.items.lock().await;
        for (app_id, item_config) in desired {
            if let Some(mut old) = items.remove(&item_config.id) {
                old.stop();
            }
            let mut executor =
                ItemExecutor::new(&app_id, &config.id, item_config, self.events());
            executor.schedule();
            info!("add item {}", executor.config().name);
            items.insert(executor.config().id.clone(), executor);
        }

        let stale: Vec<String> = items
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut executor) = items.remove(&id) {
                info!("delete item {}", executor.config().name);
                executor.stop();
            }
        }
    }

    fn sweep_orphan_scripts(&self, desired: &HashSet<String>) {
        let Ok(entries) = std::fs::read_dir(self.script_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(task_id) = script_task_id(name) else {
                continue;
            };
            if !desired.contains(task_id) {
                info!("delete orphan script {name}");
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    error!("cannot delete {name}: {e}");
                }
            }
        }
    }
}

/// `task.<id>.script` → `<id>`, for ids made of word characters.
fn script_task_id(filename: &str) -> Option<&str> {
    let id = filename.strip_prefix("task.")?.strip_suffix(".script")?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')).then_some(id)
}

#[cfg(test)]
impl Agent {
    pub(crate) async fn running_tasks(&self) -> Vec<(String, u64)> {
        let tasks = self.tasks.lock().await;
        let mut running: Vec<(String, u64)> = tasks
            .values()
            .map(|executor| (executor.config().id.clone(), executor.config().version))
            .collect();
        running.sort();
        running
    }

    pub(crate) async fn running_items(&self) -> Vec<String> {
        let items = self.items.lock().await;
        let mut running: Vec<String> = items.keys().cloned().collect();
        running.sort();
        running
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::core::config::ConnectConfig;
    use crate::core::events::AgentEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn local_agent(root: &Path) -> (Arc<Agent>, UnboundedReceiver<AgentEvent>) {
        let connect = ConnectConfig {
            id: "local".to_string(),
            key: String::new(),
            master: String::new(),
            spool_limit: 1000,
        };
        Agent::new(root.to_path_buf(), connect).await.unwrap()
    }

    fn config_yaml(task_version: u64, with_task: bool, with_item: bool) -> String {
        let mut yaml = String::from("id: \"agent1\"\non: true\napps:\n  - id: \"app1\"\n    on: true\n");
        if with_task {
            yaml.push_str(&format!(
                "    tasks:\n      - id: \"T1\"\n        name: \"cleanup\"\n        version: {task_version}\n        on: true\n        schedule: \"0 0 1 1 *\"\n        script: \"echo v{task_version}\"\n"
            ));
        }
        if with_item {
            yaml.push_str(
                "    items:\n      - id: \"I1\"\n        name: \"load\"\n        on: true\n        interval: 3600\n        collector: \"echo '{}'\"\n",
            );
        }
        yaml
    }

    #[tokio::test]
    async fn schedules_new_tasks_and_generates_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        agent.store().install(&config_yaml(1, true, false)).unwrap();
        agent.reconcile().await;

        assert_eq!(agent.running_tasks().await, vec![("T1".to_string(), 1)]);
        let script = agent.script_dir().join("task.T1.script");
        assert_eq!(std::fs::read_to_string(script).unwrap(), "echo v1");
    }

    #[tokio::test]
    async fn version_change_restarts_the_executor_and_rewrites_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        agent.store().install(&config_yaml(1, true, false)).unwrap();
        agent.reconcile().await;

        // Same version: untouched.
        agent.store().install(&config_yaml(1, true, false)).unwrap();
        agent.reconcile().await;
        assert_eq!(agent.running_tasks().await, vec![("T1".to_string(), 1)]);

        agent.store().install(&config_yaml(2, true, false)).unwrap();
        agent.reconcile().await;
        assert_eq!(agent.running_tasks().await, vec![("T1".to_string(), 2)]);
        let script = agent.script_dir().join("task.T1.script");
        assert_eq!(std::fs::read_to_string(script).unwrap(), "echo v2");
    }

    #[tokio::test]
    async fn removed_tasks_are_stopped_and_their_scripts_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        agent.store().install(&config_yaml(1, true, false)).unwrap();
        agent.reconcile().await;
        let script = agent.script_dir().join("task.T1.script");
        assert!(script.exists());

        agent.store().install(&config_yaml(1, false, false)).unwrap();
        agent.reconcile().await;
        assert!(agent.running_tasks().await.is_empty());
        assert!(!script.exists());
    }

    #[tokio::test]
    async fn orphan_scripts_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        std::fs::create_dir_all(agent.script_dir()).unwrap();
        std::fs::write(agent.script_dir().join("task.GHOST.script"), "echo boo").unwrap();
        std::fs::write(agent.script_dir().join("agent.local.conf"), "id: x").unwrap();

        agent.store().install(&config_yaml(1, true, false)).unwrap();
        agent.reconcile().await;

        assert!(!agent.script_dir().join("task.GHOST.script").exists());
        // Non-script files in the directory are left alone.
        assert!(agent.script_dir().join("agent.local.conf").exists());
        assert!(agent.script_dir().join("task.T1.script").exists());
    }

    #[tokio::test]
    async fn items_restart_on_every_pass_and_disappear_with_their_app() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        agent.store().install(&config_yaml(1, false, true)).unwrap();
        agent.reconcile().await;
        assert_eq!(agent.running_items().await, vec!["I1".to_string()]);

        // Always stop-and-restart: the pass succeeds and the item is back.
        agent.reconcile().await;
        assert_eq!(agent.running_items().await, vec!["I1".to_string()]);

        let off = "id: \"agent1\"\non: true\napps:\n  - id: \"app1\"\n    on: false\n    items:\n      - id: \"I1\"\n        name: \"load\"\n        on: true\n        collector: \"true\"\n";
        agent.store().install(off).unwrap();
        agent.reconcile().await;
        assert!(agent.running_items().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_app_hides_its_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        let yaml = "id: \"agent1\"\non: true\napps:\n  - id: \"app1\"\n    on: false\n    tasks:\n      - id: \"T1\"\n        name: \"t\"\n        version: 1\n        on: true\n        schedule: \"0 0 1 1 *\"\n        script: \"echo hidden\"\n";
        agent.store().install(yaml).unwrap();
        agent.reconcile().await;
        assert!(agent.running_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn unscheduled_tasks_are_not_in_the_running_map() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = local_agent(dir.path()).await;

        let yaml = "id: \"agent1\"\non: true\napps:\n  - id: \"app1\"\n    on: true\n    tasks:\n      - id: \"T1\"\n        name: \"manual\"\n        version: 1\n        on: true\n        schedule: \"\"\n        script: \"echo manual\"\n";
        agent.store().install(yaml).unwrap();
        agent.reconcile().await;
        assert!(agent.running_tasks().await.is_empty());
    }

    #[test]
    fn script_task_id_accepts_only_well_formed_names() {
        assert_eq!(script_task_id("task.T1.script"), Some("T1"));
        assert_eq!(script_task_id("task.abc_9.script"), Some("abc_9"));
        assert_eq!(script_task_id("task..script"), None);
        assert_eq!(script_task_id("task.a b.script"), None);
        assert_eq!(script_task_id("agent.local.conf"), None);
        assert_eq!(script_task_id("task.T1.script.bak"), None);
    }
}
