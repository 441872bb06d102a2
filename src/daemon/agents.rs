//! Agent registry - one interactive session per daemon-owned loop.
//!
//! Agents are keyed `agent-<short_id>`. Each keeps a rolling transcript of the
//! input injected through the control plane.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::domain::{LoopRecord, LoopState, QueuePayload};
use crate::error::{LoopdError, Result};
use crate::id::now_ms;
use crate::store::Store;

/// Transcript entries kept per agent.
pub const TRANSCRIPT_LIMIT: usize = 200;

/// Non-text keys an operator can send to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialKey {
    Interrupt,
    Escape,
    Enter,
    Tab,
    Backspace,
    Up,
    Down,
    Left,
    Right,
}

impl SpecialKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialKey::Interrupt => "interrupt",
            SpecialKey::Escape => "escape",
            SpecialKey::Enter => "enter",
            SpecialKey::Tab => "tab",
            SpecialKey::Backspace => "backspace",
            SpecialKey::Up => "up",
            SpecialKey::Down => "down",
            SpecialKey::Left => "left",
            SpecialKey::Right => "right",
        }
    }
}

impl fmt::Display for SpecialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecialKey {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "interrupt" | "ctrl-c" => Ok(SpecialKey::Interrupt),
            "escape" | "esc" => Ok(SpecialKey::Escape),
            "enter" => Ok(SpecialKey::Enter),
            "tab" => Ok(SpecialKey::Tab),
            "backspace" => Ok(SpecialKey::Backspace),
            "up" => Ok(SpecialKey::Up),
            "down" => Ok(SpecialKey::Down),
            "left" => Ok(SpecialKey::Left),
            "right" => Ok(SpecialKey::Right),
            other => Err(LoopdError::InvalidArgument(format!("unknown special key: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Key { at: i64, key: SpecialKey },
    Text { at: i64, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub loop_id: String,
    pub name: String,
    pub workspace_id: String,
    pub state: LoopState,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDetail {
    #[serde(flatten)]
    pub summary: AgentSummary,
    pub working_dir: Option<PathBuf>,
    pub created_at: i64,
    pub transcript: Vec<TranscriptEntry>,
}

/// Filter for listing agents; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentFilter {
    pub workspace_id: Option<String>,
    pub states: Vec<LoopState>,
}

impl AgentFilter {
    fn matches(&self, agent: &Agent) -> bool {
        self.workspace_id.as_ref().is_none_or(|ws| *ws == agent.workspace_id)
            && (self.states.is_empty() || self.states.contains(&agent.state))
    }
}

/// Where injected input ends up.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn send_key(&self, loop_id: &str, key: SpecialKey) -> Result<()>;

    /// Deliver text; returns the queue item created for it, if any.
    async fn send_text(&self, loop_id: &str, text: &str) -> Result<Option<String>>;
}

/// Delivers text as `message` queue items for the agent's loop.
///
/// Loop commands are not terminals, so keys are recorded but not forwarded.
pub struct QueueInputSink {
    store: std::sync::Arc<Store>,
}

impl QueueInputSink {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InputSink for QueueInputSink {
    async fn send_key(&self, loop_id: &str, key: SpecialKey) -> Result<()> {
        debug!("Key {} for loop {} recorded only", key, loop_id);
        Ok(())
    }

    async fn send_text(&self, loop_id: &str, text: &str) -> Result<Option<String>> {
        let item = self.store.queue().enqueue_payload(
            loop_id,
            QueuePayload::Message {
                text: text.to_string(),
            },
        )?;
        Ok(Some(item.id))
    }
}

#[derive(Debug, Clone)]
struct Agent {
    id: String,
    loop_id: String,
    name: String,
    workspace_id: String,
    working_dir: Option<PathBuf>,
    state: LoopState,
    created_at: i64,
    updated_at: i64,
    transcript: VecDeque<TranscriptEntry>,
}

impl Agent {
    fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.id.clone(),
            loop_id: self.loop_id.clone(),
            name: self.name.clone(),
            workspace_id: self.workspace_id.clone(),
            state: self.state,
            updated_at: self.updated_at,
        }
    }

    fn detail(&self) -> AgentDetail {
        AgentDetail {
            summary: self.summary(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            transcript: self.transcript.iter().cloned().collect(),
        }
    }
}

pub fn agent_id_for(record: &LoopRecord) -> String {
    format!("agent-{}", record.short_id)
}

/// Stable identifier of a working directory (first 16 hex chars of its SHA-256).
pub fn workspace_id(working_dir: Option<&Path>) -> String {
    let path = match working_dir {
        Some(dir) => dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()),
        None => PathBuf::new(),
    };
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) the agent of a loop; keeps an existing transcript.
    pub async fn register(&self, record: &LoopRecord) -> String {
        let id = agent_id_for(record);
        let now = now_ms();
        let mut agents = self.agents.write().await;
        let agent = agents.entry(id.clone()).or_insert_with(|| Agent {
            id: id.clone(),
            loop_id: record.id.clone(),
            name: record.name.clone(),
            workspace_id: workspace_id(record.config.working_dir.as_deref()),
            working_dir: record.config.working_dir.clone(),
            state: record.state,
            created_at: now,
            updated_at: now,
            transcript: VecDeque::new(),
        });
        agent.state = record.state;
        agent.updated_at = now;
        id
    }

    pub async fn set_state(&self, loop_id: &str, state: LoopState) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.values_mut().find(|a| a.loop_id == loop_id) {
            agent.state = state;
            agent.updated_at = now_ms();
        }
    }

    pub async fn loop_id_of(&self, agent_id: &str) -> Option<String> {
        self.agents.read().await.get(agent_id).map(|a| a.loop_id.clone())
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDetail> {
        self.agents.read().await.get(agent_id).map(Agent::detail)
    }

    /// Matching agents ordered by id.
    pub async fn list(&self, filter: &AgentFilter) -> Vec<AgentSummary> {
        let agents = self.agents.read().await;
        let mut summaries: Vec<AgentSummary> = agents
            .values()
            .filter(|agent| filter.matches(agent))
            .map(Agent::summary)
            .collect();
        summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        summaries
    }

    /// Append to the agent's transcript, dropping the oldest entries past
    /// [`TRANSCRIPT_LIMIT`].
    pub async fn record(&self, agent_id: &str, entries: Vec<TranscriptEntry>) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| LoopdError::NotFound(agent_id.to_string()))?;
        for entry in entries {
            if agent.transcript.len() == TRANSCRIPT_LIMIT {
                agent.transcript.pop_front();
            }
            agent.transcript.push_back(entry);
        }
        agent.updated_at = now_ms();
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }
}
