//! Loop record and related types
//!
//! A LoopRecord is one configured repeating task. Besides identity and
//! configuration it carries the runtime state and the ownership fields that
//! decide which process is allowed to drive it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::stop_rule::StopRule;
use crate::error::{LoopdError, Result};

/// Default per-iteration command timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

/// Runtime state of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// Configured, not driven by anyone
    Idle,
    /// Iterating under an owner
    Running,
    /// Suspended by a pause item
    Paused,
    /// Stop requested, finishing the in-flight iteration
    Stopping,
    Stopped,
    Failed,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
            LoopState::Failed => "failed",
        }
    }

    /// States in which an owner is driving the loop and heartbeating
    pub fn is_active(&self) -> bool {
        matches!(self, LoopState::Running | LoopState::Paused | LoopState::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopState {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(LoopState::Idle),
            "running" => Ok(LoopState::Running),
            "paused" => Ok(LoopState::Paused),
            "stopping" => Ok(LoopState::Stopping),
            "stopped" => Ok(LoopState::Stopped),
            "failed" => Ok(LoopState::Failed),
            other => Err(LoopdError::InvalidArgument(format!("unknown loop state: {other}"))),
        }
    }
}

/// Who drives a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Local,
    Daemon,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Local => "local",
            OwnerKind::Daemon => "daemon",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerKind {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(OwnerKind::Local),
            "daemon" => Ok(OwnerKind::Daemon),
            other => Err(LoopdError::InvalidArgument(format!("unknown owner kind: {other}"))),
        }
    }
}

/// Per-loop configuration, fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Command to run each iteration. Without `args` it runs under `sh -c`.
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub stop_rules: Vec<StopRule>,
    /// Harness/profile reference handed to the command
    pub profile: Option<String>,
    /// Prompt name, path or text handed to the command
    pub prompt: Option<String>,
    /// 0 = unlimited
    pub max_iterations: u32,
    /// 0 = unlimited
    pub max_runtime_secs: u64,
    /// Sleep between iterations
    pub interval_secs: u64,
    pub replicas: u32,
    /// Restart under a new owner after stale reclaim. None = global default.
    pub auto_restart: Option<bool>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stop_rules: Vec::new(),
            profile: None,
            prompt: None,
            max_iterations: 0,
            max_runtime_secs: 0,
            interval_secs: 0,
            replicas: 1,
            auto_restart: None,
        }
    }
}

impl LoopConfig {
    /// Create a config running `command` under `sh -c`
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_stop_rule(mut self, rule: StopRule) -> Self {
        self.stop_rules.push(rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(LoopdError::InvalidArgument("loop command is required".into()));
        }
        if self.timeout_secs == 0 {
            return Err(LoopdError::InvalidArgument("timeout_secs must be positive".into()));
        }
        if self.replicas == 0 {
            return Err(LoopdError::InvalidArgument("replicas must be at least 1".into()));
        }
        for rule in &self.stop_rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// The durable record of one loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRecord {
    //=== Identity ===
    pub id: String,
    pub name: String,
    /// Prefix-unique abbreviation of `id`
    pub short_id: String,

    //=== Configuration ===
    pub config: LoopConfig,

    //=== Runtime State ===
    pub state: LoopState,
    /// Commands executed so far
    pub iteration_count: u32,
    /// Human-readable reason for the last stop
    pub stop_reason: Option<String>,
    pub last_error: Option<String>,

    //=== Ownership ===
    pub owner_kind: Option<OwnerKind>,
    pub owner_instance_id: Option<String>,
    pub last_heartbeat_at: Option<i64>,

    //=== Timestamps ===
    pub started_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl LoopRecord {
    /// True when some owner holds the loop and its heartbeat is younger than
    /// `stale_threshold_ms` at `now`.
    pub fn has_live_owner(&self, now: i64, stale_threshold_ms: i64) -> bool {
        match (&self.owner_instance_id, self.last_heartbeat_at) {
            (Some(_), Some(beat)) => now - beat < stale_threshold_ms,
            _ => false,
        }
    }

    /// Age of the last heartbeat at `now`, if any
    pub fn heartbeat_age_ms(&self, now: i64) -> Option<i64> {
        self.last_heartbeat_at.map(|beat| now - beat)
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.owner_instance_id.as_deref() == Some(instance_id)
    }

    /// Owner description for messages
    pub fn owner_label(&self) -> String {
        match (&self.owner_kind, &self.owner_instance_id) {
            (Some(kind), Some(id)) => format!("{kind}:{id}"),
            (None, Some(id)) => id.clone(),
            _ => "none".to_string(),
        }
    }
}
