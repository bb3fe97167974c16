use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::config::ItemConfig;
use crate::core::events::{AgentEvent, EventSender, ITEM_EVENT_NAME, ItemEvent, unix_now};
use crate::platform::{NativePlatform, Platform};

/// Periodic collector for one monitoring item. Unlike tasks, items are
/// always restarted wholesale on reconcile, so there is no version logic
/// here: the executor is built, runs until stopped, and is thrown away.
pub struct ItemExecutor {
    runner: Arc<ItemRunner>,
    handle: Option<JoinHandle<()>>,
}

struct ItemRunner {
    config: ItemConfig,
    app_id: String,
    agent_id: String,
    events: EventSender,
}

impl ItemExecutor {
    pub fn new(app_id: &str, agent_id: &str, config: ItemConfig, events: EventSender) -> Self {
        Self {
            runner: Arc::new(ItemRunner {
                config,
                app_id: app_id.to_string(),
                agent_id: agent_id.to_string(),
                events,
            }),
            handle: None,
        }
    }

    pub fn config(&self) -> &ItemConfig {
        &self.runner.config
    }

    /// Start the interval loop. Collections run strictly one after another:
    /// the next sleep only starts when the previous collection finished.
    pub fn schedule(&mut self) {
        let runner = self.runner.clone();
        let interval = Duration::from_secs(self.runner.config.interval.max(1));
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                runner.collect().await;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ItemExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ItemRunner {
    /// One collection round. Collector failures become events with the
    /// `error` field set; they never break the schedule.
    async fn collect(&self) {
        let (values, error) = match self.run_collector().await {
            Ok(values) => (values, None),
            Err(e) => {
                debug!("item {} collector failed: {e:#}", self.config.id);
                (serde_json::json!({}), Some(format!("{e:#}")))
            }
        };
        let _ = self.events.send(AgentEvent::Item(ItemEvent {
            event: ITEM_EVENT_NAME,
            agent_id: self.agent_id.clone(),
            app_id: self.app_id.clone(),
            item_id: self.config.id.clone(),
            values,
            error,
            timestamp: unix_now(),
        }));
    }

    async fn run_collector(&self) -> Result<serde_json::Value> {
        let command = self.config.collector.trim();
        if command.is_empty() {
            bail!("no collector command configured");
        }
        let mut cmd = NativePlatform::shell_inline(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = cmd.output().await.context("cannot spawn collector")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "collector exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(other) => serde_json::json!({ "output": other }),
            Err(_) => serde_json::json!({ "output": trimmed }),
        })
    }
}
