//! Control-plane operations a daemon exposes to remote callers.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use super::agents::{AgentDetail, AgentFilter, AgentSummary, SpecialKey, TranscriptEntry};
use super::context::DaemonContext;
use crate::error::{LoopdError, Result};
use crate::id::now_ms;
use crate::ipc::messages::DaemonEvent;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub version: String,
    pub server_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    /// The store cannot be read
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub hostname: String,
    pub instance_id: String,
    pub started_at: i64,
    pub uptime_secs: u64,
    pub health: Health,
    pub owned_loop_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInputAck {
    pub agent_id: String,
    pub keys_sent: usize,
    /// Queue item created for the text, if any
    pub queue_item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStartAck {
    pub loop_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStopAck {
    pub loop_id: String,
    /// False when this daemon did not own the loop
    pub stopping: bool,
}

/// The daemon's remote operations, independent of transport.
#[derive(Clone)]
pub struct ControlPlane {
    ctx: Arc<DaemonContext>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    /// Liveness check without side effects.
    pub fn ping(&self) -> PingInfo {
        PingInfo {
            version: VERSION.to_string(),
            server_time: now_ms(),
        }
    }

    pub async fn get_status(&self) -> DaemonStatus {
        let now = now_ms();
        let health = match self.ctx.store.loops().list_owned_by(&self.ctx.instance_id) {
            Ok(_) => Health::Ok,
            Err(_) => Health::Degraded,
        };
        DaemonStatus {
            version: VERSION.to_string(),
            hostname: self.ctx.hostname.clone(),
            instance_id: self.ctx.instance_id.clone(),
            started_at: self.ctx.started_at,
            uptime_secs: ((now - self.ctx.started_at).max(0) / 1000) as u64,
            health,
            owned_loop_count: self.ctx.owned_loop_count().await,
        }
    }

    /// Inject input into an agent: special keys first, then text.
    pub async fn send_input(&self, agent_id: &str, text: &str, special_keys: &[SpecialKey]) -> Result<SendInputAck> {
        if agent_id.trim().is_empty() {
            return Err(LoopdError::InvalidArgument("agent_id is required".into()));
        }
        let loop_id = self
            .ctx
            .agents
            .loop_id_of(agent_id)
            .await
            .ok_or_else(|| LoopdError::NotFound(agent_id.to_string()))?;

        let mut entries = Vec::with_capacity(special_keys.len() + 1);
        for key in special_keys {
            self.ctx.sink.send_key(&loop_id, *key).await?;
            entries.push(TranscriptEntry::Key { at: now_ms(), key: *key });
        }

        let mut queue_item_id = None;
        if !text.is_empty() {
            queue_item_id = self.ctx.sink.send_text(&loop_id, text).await?;
            entries.push(TranscriptEntry::Text {
                at: now_ms(),
                text: text.to_string(),
            });
        }

        self.ctx.agents.record(agent_id, entries).await?;
        let keys: Vec<String> = special_keys.iter().map(|k| k.to_string()).collect();
        self.ctx.broadcast(DaemonEvent::agent_input(agent_id, text, &keys));

        Ok(SendInputAck {
            agent_id: agent_id.to_string(),
            keys_sent: special_keys.len(),
            queue_item_id,
        })
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<AgentSummary> {
        self.ctx.agents.list(filter).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentDetail> {
        self.ctx
            .agents
            .get(agent_id)
            .await
            .ok_or_else(|| LoopdError::NotFound(agent_id.to_string()))
    }

    /// Claim a loop for this daemon and start its runner.
    pub async fn start_loop_runner(&self, loop_id: &str) -> Result<RunnerStartAck> {
        let instance_id = self.ctx.start_loop_runner(loop_id).await?;
        Ok(RunnerStartAck {
            loop_id: loop_id.to_string(),
            instance_id,
        })
    }

    /// Request a graceful stop. Not owning the loop is a successful no-op.
    pub async fn stop_loop_runner(&self, loop_id: &str) -> RunnerStopAck {
        let stopping = self.ctx.stop_loop_runner(loop_id).await;
        if !stopping {
            info!("Stop for {} ignored: not owned by this daemon", loop_id);
        }
        RunnerStopAck {
            loop_id: loop_id.to_string(),
            stopping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::agents::InputSink;
    use crate::domain::LoopConfig;
    use crate::runner::RunnerConfig;
    use crate::store::test_support::temp_store;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the order in which input reaches the sink.
    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InputSink for RecordingSink {
        async fn send_key(&self, _loop_id: &str, key: SpecialKey) -> Result<()> {
            self.calls.lock().unwrap().push(format!("key:{key}"));
            Ok(())
        }

        async fn send_text(&self, _loop_id: &str, text: &str) -> Result<Option<String>> {
            self.calls.lock().unwrap().push(format!("text:{text}"));
            Ok(None)
        }
    }

    fn control_plane(sink: Arc<RecordingSink>) -> (ControlPlane, tempfile::TempDir) {
        let (store, temp) = temp_store();
        let ctx = DaemonContext::new(Arc::new(store), RunnerConfig::default(), Duration::from_secs(60)).with_sink(sink);
        (ControlPlane::new(Arc::new(ctx)), temp)
    }

    #[tokio::test]
    async fn test_ping_has_no_side_effects() {
        let (cp, _temp) = control_plane(Arc::default());
        let info = cp.ping();
        assert_eq!(info.version, VERSION);
        assert!(info.server_time > 0);
        assert_eq!(cp.context().owned_loop_count().await, 0);
    }

    #[tokio::test]
    async fn test_status() {
        let (cp, _temp) = control_plane(Arc::default());
        let status = cp.get_status().await;
        assert_eq!(status.health, Health::Ok);
        assert_eq!(status.owned_loop_count, 0);
        assert!(status.instance_id.starts_with("daemon-"));
        assert!(!status.hostname.is_empty());
    }

    #[tokio::test]
    async fn test_send_input_keys_before_text() {
        let sink = Arc::new(RecordingSink::default());
        let (cp, _temp) = control_plane(Arc::clone(&sink));
        let record = cp.context().store.loops().create("a", LoopConfig::shell("true")).unwrap();
        let agent_id = cp.context().agents.register(&record).await;

        let ack = cp
            .send_input(&agent_id, "continue", &[SpecialKey::Interrupt, SpecialKey::Enter])
            .await
            .unwrap();
        assert_eq!(ack.keys_sent, 2);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec!["key:interrupt", "key:enter", "text:continue"]
        );

        let detail = cp.get_agent(&agent_id).await.unwrap();
        assert_eq!(detail.transcript.len(), 3);
        assert!(matches!(detail.transcript[2], TranscriptEntry::Text { .. }));
    }

    #[tokio::test]
    async fn test_send_input_validation() {
        let (cp, _temp) = control_plane(Arc::default());
        assert!(matches!(
            cp.send_input("", "x", &[]).await,
            Err(LoopdError::InvalidArgument(_))
        ));
        assert!(matches!(
            cp.send_input("agent-missing", "x", &[]).await,
            Err(LoopdError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_agent_not_found() {
        let (cp, _temp) = control_plane(Arc::default());
        assert!(matches!(cp.get_agent("agent-x").await, Err(LoopdError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_unowned_loop_is_success() {
        let (cp, _temp) = control_plane(Arc::default());
        let ack = cp.stop_loop_runner("someone-elses").await;
        assert!(!ack.stopping);
    }
}
