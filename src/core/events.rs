use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

/// Producers hand events to the ingestor through this channel; sends never
/// block and a closed receiver is treated as "nobody is listening" (the
/// one-shot `run` verb does exactly that).
pub type EventSender = tokio::sync::mpsc::UnboundedSender<AgentEvent>;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessEventKind {
    Start,
    Stop,
    Stdout,
    Stderr,
}

/// Lifecycle and output of one task run. `unique_id` ties the start, output
/// and stop records of a single run together on the master side.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEvent {
    pub event: ProcessEventKind,
    pub agent_id: String,
    pub app_id: String,
    pub task_id: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    pub timestamp: u64,
}

/// One round of collector values for a monitoring item. A failed collector
/// still produces an event, with `error` set and empty `values`.
#[derive(Debug, Clone, Serialize)]
pub struct ItemEvent {
    pub event: &'static str,
    pub agent_id: String,
    pub app_id: String,
    pub item_id: String,
    pub values: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

pub const ITEM_EVENT_NAME: &str = "item";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AgentEvent {
    Process(ProcessEvent),
    Item(ItemEvent),
}

impl AgentEvent {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
