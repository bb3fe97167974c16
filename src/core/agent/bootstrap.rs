//! Boot sequence and the long-lived workers: the pull loop, the event
//! ingestor and the spool drainer. No failure in any of them (one task, one
//! event, one push) may take the orchestrator down; errors are logged and
//! the loops carry on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use super::Agent;
use crate::core::events::{AgentEvent, ProcessEventKind};
use crate::core::executor::TaskRunner;
use crate::core::master::MasterEvent;

/// Back-off after a failed pull or config refetch.
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Back-off after a failed push, so a broken master is not hammered.
const PUSH_BACKOFF: Duration = Duration::from_secs(5);
/// Pause between two spool sweeps.
const SWEEP_DELAY: Duration = Duration::from_secs(1);
/// How often the local config file is (re)checked in offline mode.
const LOCAL_RELOAD_DELAY: Duration = Duration::from_secs(30);

/// Run the agent until the process is killed. Only the initial config is
/// allowed to fail hard; after that the loop never exits.
pub async fn run(agent: Arc<Agent>, events: UnboundedReceiver<AgentEvent>) -> Result<()> {
    agent.start_scheduler().await?;

    info!("starting ...");
    if agent.is_local() {
        load_local_until_valid(&agent).await;
    } else {
        agent.fetch_and_install().await.context("start failed")?;
    }

    info!("booting ...");
    agent.boot_tasks();
    agent.reconcile().await;

    tokio::spawn(ingest_events(agent.clone(), events));

    if agent.is_local() {
        // Offline mode: no master traffic at all. Keep watching the local
        // file so operators can drop a new config in at any time.
        loop {
            tokio::time::sleep(LOCAL_RELOAD_DELAY).await;
            match agent.store().load_local() {
                Ok(Some(config)) => {
                    info!("local config changed, reconciling");
                    agent.adopt_identity(&config);
                    agent.reconcile().await;
                }
                Ok(None) => {}
                Err(e) => warn!("[agent] {e:#}"),
            }
        }
    } else {
        tokio::spawn(drain_spool(agent.clone()));
        loop {
            match pull_once(&agent).await {
                Ok(()) => {}
                Err(e) => {
                    error!("pull error: {e:#}");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

/// In offline mode the agent is useless without a config, so block until
/// one appears; operators drop the file in after boot.
async fn load_local_until_valid(agent: &Agent) {
    loop {
        match agent.store().load_local() {
            Ok(Some(config)) => {
                agent.adopt_identity(&config);
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!("[agent] {e:#}");
                tokio::time::sleep(LOCAL_RELOAD_DELAY).await;
            }
        }
    }
}

async fn pull_once(agent: &Agent) -> Result<()> {
    let master = agent.master().context("master client not configured")?;
    let events = master.pull_events(&agent.credentials()).await?;
    for event in events {
        agent.handle_master_event(event).await;
    }
    Ok(())
}

impl Agent {
    /// Dispatch one event received over the long-poll channel. Unknown
    /// names are ignored so newer masters can talk to older agents.
    pub async fn handle_master_event(&self, event: MasterEvent) {
        match event.name.as_str() {
            "UPDATE_AGENT" | "ADD_APP" | "UPDATE_APP" | "REMOVE_APP" | "ADD_TASK"
            | "UPDATE_TASK" | "REMOVE_TASK" | "ADD_ITEM" | "UPDATE_ITEM" | "DELETE_ITEM" => {
                match self.fetch_and_install().await {
                    Ok(()) => self.reconcile().await,
                    Err(e) => error!("cannot refresh config: {e:#}"),
                }
            }
            "RUN_TASK" => {
                let Some(task_id) = event.data.get("taskId").and_then(|v| v.as_str()) else {
                    warn!("invalid RUN_TASK event data: taskId missing");
                    return;
                };
                let config = self.config();
                match config.find_task(task_id) {
                    Some((app, task)) => {
                        // Deliberately independent of any scheduled
                        // instance; a second copy may run concurrently.
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
                    None => error!("no task with id '{task_id}' found"),
                }
            }
            other => debug!("ignoring unknown master event '{other}'"),
        }
    }
}

/// Move events from the in-memory channel into the spool, mirroring task
/// output to the log on master-connected agents.
async fn ingest_events(agent: Arc<Agent>, mut events: UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        if !agent.is_local()
            && let AgentEvent::Process(pe) = &event
        {
            let config = agent.config();
            let name = config.task_name(&pe.task_id).unwrap_or_default();
            match pe.event {
                ProcessEventKind::Start => info!("[{name}] start"),
                ProcessEventKind::Stop => info!("[{name}] stop"),
                ProcessEventKind::Stdout | ProcessEventKind::Stderr => {
                    info!("[{name}] {}", pe.data)
                }
            }
        }

        match event.to_json() {
            Ok(bytes) => {
                if let Err(e) = agent.spool().append(&bytes).await {
                    error!("spool append error: {e:#}");
                }
            }
            Err(e) => error!("cannot serialize event: {e:#}"),
        }
    }
}

/// Forward spooled events to the master forever. Records are deleted only
/// after the master acknowledged them, so delivery is at-least-once and a
/// crash in between produces a duplicate, never a loss.
async fn drain_spool(agent: Arc<Agent>) {
    let Some(master) = agent.master() else { return };
    loop {
        let pending = agent.spool().len().await;
        if pending > 0 {
            debug!("spool sweep: {pending} event(s) pending");
        }
        let mut cursor = 0u64;
        loop {
            let record = match agent.spool().next_after(cursor).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    error!("spool read error: {e:#}");
                    break;
                }
            };
            let (key, value) = record;
            cursor = key;
            match master.push_event(&agent.credentials(), value).await {
                Ok(()) => {
                    if let Err(e) = agent.spool().remove(key).await {
                        error!("spool delete error: {e:#}");
                    }
                }
                Err(e) => {
                    error!("push error: {e:#}");
                    tokio::time::sleep(PUSH_BACKOFF).await;
                }
            }
        }
        tokio::time::sleep(SWEEP_DELAY).await;
    }
}
