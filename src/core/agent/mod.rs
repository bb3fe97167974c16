//! The agent handle: owns the connect identity, the config snapshot, the
//! running-executor maps, the spool and the cron scheduler. There are no
//! process-wide globals; everything hangs off this one struct.

mod bootstrap;
mod reconcile;

pub use bootstrap::run;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio_cron_scheduler::JobScheduler;

use crate::core::config::{AgentConfig, ConfigStore, ConnectConfig};
use crate::core::events::{AgentEvent, EventSender};
use crate::core::executor::{ItemExecutor, TaskExecutor};
use crate::core::master::{Credentials, MasterClient};
use crate::core::spool::EventSpool;

pub struct Agent {
    local: bool,
    connect: RwLock<ConnectConfig>,
    store: ConfigStore,
    master: Option<MasterClient>,
    spool: EventSpool,
    scheduler: JobScheduler,
    tasks: Mutex<HashMap<String, TaskExecutor>>,
    items: Mutex<HashMap<String, ItemExecutor>>,
    events: EventSender,
}

impl Agent {
    /// Build the agent and the receiving end of its event channel. The
    /// receiver is handed to the ingestor worker by [`run`].
    pub async fn new(
        root: PathBuf,
        connect: ConnectConfig,
    ) -> Result<(std::sync::Arc<Self>, UnboundedReceiver<AgentEvent>)> {
        let local = connect.is_local();
        let master = if local {
            None
        } else {
            Some(MasterClient::new(&connect.master)?)
        };
        let spool = EventSpool::open(&root.join("logs").join("spool.db"), connect.spool_limit)?;
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("cannot create scheduler: {e}"))?;
        let store = ConfigStore::new(&root);
        let (events, rx) = unbounded_channel();

        let agent = std::sync::Arc::new(Self {
            local,
            connect: RwLock::new(connect),
            store,
            master,
            spool,
            scheduler,
            tasks: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
            events,
        });
        Ok((agent, rx))
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Current config snapshot; cheap to clone, safe to hold across awaits.
    pub fn config(&self) -> std::sync::Arc<AgentConfig> {
        self.store.current()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn master(&self) -> Option<&MasterClient> {
        self.master.as_ref()
    }

    pub fn spool(&self) -> &EventSpool {
        &self.spool
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn script_dir(&self) -> PathBuf {
        self.store.agents_dir()
    }

    pub fn credentials(&self) -> Credentials {
        let connect = self.connect.read().expect("connect lock poisoned");
        Credentials {
            id: connect.id.clone(),
            key: connect.key.clone(),
        }
    }

    pub async fn start_scheduler(&self) -> Result<()> {
        // The scheduler is a cloneable handle over shared state.
        let mut scheduler = self.scheduler.clone();
        scheduler
            .start()
            .await
            .map_err(|e| anyhow!("cannot start scheduler: {e}"))
    }

    /// A freshly installed config may re-key the agent; the next request to
    /// the master already authenticates with the new identity. In local
    /// mode the id stays `"local"`.
    pub fn adopt_identity(&self, config: &AgentConfig) {
        let mut connect = self.connect.write().expect("connect lock poisoned");
        if !self.local {
            connect.id = config.id.clone();
        }
        connect.key = config.key.clone();
    }

    /// Fetch the config from the master and install it. Reconciliation is
    /// the caller's move; the initial boot runs boot tasks in between.
    pub async fn fetch_and_install(&self) -> Result<()> {
        let master = self.master().context("master client not configured")?;
        let raw = master.fetch_config(&self.credentials()).await?;
        let config = self.store.install(&raw)?;
        self.adopt_identity(&config);
        Ok(())
    }
}
