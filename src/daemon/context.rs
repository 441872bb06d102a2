//! Daemon context - shared state for request handlers
//!
//! DaemonContext owns everything the control plane needs: the store, the
//! runners this daemon drives, the agent registry and event broadcasting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use super::agents::{AgentRegistry, InputSink, QueueInputSink};
use crate::domain::OwnerKind;
use crate::error::{LoopdError, Result};
use crate::id::{generate_instance_id, now_ms};
use crate::ipc::messages::DaemonEvent;
use crate::recovery::Restarter;
use crate::runner::{CommandExecutor, LoopRunner, RunnerConfig, RunnerControl, RunnerEvent, ShellExecutor};
use crate::store::Store;

struct RunnerHandle {
    generation: u64,
    control: RunnerControl,
    task: JoinHandle<()>,
}

/// Shared context for all daemon request handlers
pub struct DaemonContext {
    pub store: Arc<Store>,
    pub instance_id: String,
    pub started_at: i64,
    pub hostname: String,
    pub agents: AgentRegistry,
    pub sink: Arc<dyn InputSink>,
    executor: Arc<dyn CommandExecutor>,
    runner_config: RunnerConfig,
    stale_threshold_ms: i64,
    runners: Mutex<HashMap<String, RunnerHandle>>,
    next_generation: std::sync::atomic::AtomicU64,
    runner_events: broadcast::Sender<RunnerEvent>,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl DaemonContext {
    pub fn new(store: Arc<Store>, runner_config: RunnerConfig, stale_threshold: Duration) -> Self {
        let sink = Arc::new(QueueInputSink::new(Arc::clone(&store)));
        let (runner_events, _) = broadcast::channel(256);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store,
            instance_id: generate_instance_id("daemon"),
            started_at: now_ms(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            agents: AgentRegistry::new(),
            sink,
            executor: Arc::new(ShellExecutor::new()),
            runner_config,
            stale_threshold_ms: stale_threshold.as_millis() as i64,
            runners: Mutex::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            runner_events,
            event_tx,
        }
    }

    /// Replace the command executor (tests use a scripted one).
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn InputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use the IPC server's event channel for pushed events.
    pub fn with_event_sender(mut self, event_tx: broadcast::Sender<DaemonEvent>) -> Self {
        self.event_tx = event_tx;
        self
    }

    /// Broadcast an event to all connected clients
    pub fn broadcast(&self, event: DaemonEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn runner_events(&self) -> broadcast::Receiver<RunnerEvent> {
        self.runner_events.subscribe()
    }

    pub async fn owned_loop_count(&self) -> usize {
        self.runners.lock().await.len()
    }

    pub async fn is_running(&self, loop_id: &str) -> bool {
        self.runners.lock().await.contains_key(loop_id)
    }

    /// Claim `loop_id` for this daemon and start driving it.
    ///
    /// Idempotent: a loop this daemon already runs is left alone.
    pub async fn start_loop_runner(self: &Arc<Self>, loop_id: &str) -> Result<String> {
        let mut runners = self.runners.lock().await;
        if runners.contains_key(loop_id) {
            return Ok(self.instance_id.clone());
        }

        let record = self.store.loops().claim_owner(
            loop_id,
            OwnerKind::Daemon,
            &self.instance_id,
            now_ms(),
            self.stale_threshold_ms,
        )?;
        self.agents.register(&record).await;

        let runner = match LoopRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            loop_id,
            &self.instance_id,
            self.runner_config.clone(),
        ) {
            Ok(runner) => runner.with_events(self.runner_events.clone()),
            Err(e) => {
                self.release_after_failed_start(loop_id, &e);
                return Err(e);
            }
        };
        let control = runner.control();
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let ctx = Arc::clone(self);
        let id = loop_id.to_string();
        let task = tokio::spawn(async move {
            match runner.run().await {
                Ok(outcome) => info!("Daemon runner for {} finished: {}", id, outcome),
                Err(LoopdError::OwnershipLost(_)) => warn!("Daemon lost ownership of {}", id),
                Err(e) => warn!("Daemon runner for {} failed: {}", id, e),
            }
            let mut runners = ctx.runners.lock().await;
            if runners.get(&id).is_some_and(|h| h.generation == generation) {
                runners.remove(&id);
            }
        });

        runners.insert(
            loop_id.to_string(),
            RunnerHandle {
                generation,
                control,
                task,
            },
        );
        info!("Daemon {} now owns loop {}", self.instance_id, loop_id);
        Ok(self.instance_id.clone())
    }

    fn release_after_failed_start(&self, loop_id: &str, error: &LoopdError) {
        let released = self.store.loops().release_owner(
            loop_id,
            &self.instance_id,
            crate::domain::LoopState::Failed,
            None,
            Some(&error.to_string()),
            now_ms(),
        );
        if let Err(e) = released {
            warn!("Failed to release {} after failed start: {}", loop_id, e);
        }
    }

    /// Ask the runner of `loop_id` to stop. Returns false when this daemon
    /// does not drive that loop.
    pub async fn stop_loop_runner(&self, loop_id: &str) -> bool {
        match self.runners.lock().await.get(loop_id) {
            Some(handle) => {
                handle.control.request_stop();
                debug!("Stop requested for daemon runner {}", loop_id);
                true
            }
            None => false,
        }
    }

    /// Request every runner to stop and wait up to `grace` for them.
    /// Runners still busy afterwards are aborted; their loops go stale and
    /// are reclaimed by the next sweep.
    pub async fn shutdown_runners(&self, grace: Duration) {
        let handles: Vec<(String, RunnerHandle)> = self.runners.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} daemon runners", handles.len());

        for (_, handle) in &handles {
            handle.control.request_stop();
        }
        let deadline = tokio::time::Instant::now() + grace;
        for (loop_id, handle) in handles {
            let abort = handle.task.abort_handle();
            if tokio::time::timeout_at(deadline, handle.task).await.is_err() {
                warn!("Runner for {} did not stop in time; aborting", loop_id);
                abort.abort();
            }
        }
    }

    /// Forward runner events to IPC subscribers and the agent registry.
    pub async fn forward_runner_events(self: Arc<Self>) {
        let mut events = self.runner_events();
        loop {
            match events.recv().await {
                Ok(RunnerEvent::StateChanged { loop_id, state }) => {
                    self.agents.set_state(&loop_id, state).await;
                    self.broadcast(DaemonEvent::loop_state(&loop_id, state));
                }
                Ok(RunnerEvent::IterationCompleted {
                    loop_id,
                    sequence,
                    exit_code,
                    decision,
                }) => {
                    self.broadcast(DaemonEvent::loop_iteration(&loop_id, sequence, exit_code, &decision));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Runner event forwarder skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Restarts reclaimed loops under this daemon.
pub struct DaemonRestarter {
    ctx: Arc<DaemonContext>,
}

impl DaemonRestarter {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Restarter for DaemonRestarter {
    async fn restart(&self, loop_id: &str) -> Result<OwnerKind> {
        self.ctx.start_loop_runner(loop_id).await?;
        Ok(OwnerKind::Daemon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CommandResult, LoopConfig, LoopState};
    use crate::runner::CommandSpec;
    use crate::store::test_support::temp_store;

    /// Executor whose commands run until told to finish.
    struct SlowExecutor;

    #[async_trait]
    impl CommandExecutor for SlowExecutor {
        async fn execute(&self, _spec: &CommandSpec) -> CommandResult {
            tokio::time::sleep(Duration::from_millis(20)).await;
            CommandResult::completed(0, "", "")
        }
    }

    fn context() -> (Arc<DaemonContext>, tempfile::TempDir) {
        let (store, temp) = temp_store();
        let config = RunnerConfig {
            heartbeat_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            output_tail_bytes: 1024,
        };
        let ctx = DaemonContext::new(Arc::new(store), config, Duration::from_secs(60))
            .with_executor(Arc::new(SlowExecutor));
        (Arc::new(ctx), temp)
    }

    async fn wait_until_stopped(ctx: &DaemonContext, loop_id: &str) {
        for _ in 0..300 {
            if !ctx.is_running(loop_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runner never finished");
    }

    #[tokio::test]
    async fn test_start_and_stop_runner() {
        let (ctx, _temp) = context();
        let record = ctx.store.loops().create("d", LoopConfig::shell("./agent")).unwrap();

        let instance = ctx.start_loop_runner(&record.id).await.unwrap();
        assert_eq!(instance, ctx.instance_id);
        assert_eq!(ctx.owned_loop_count().await, 1);
        // Second start is a no-op
        ctx.start_loop_runner(&record.id).await.unwrap();
        assert_eq!(ctx.owned_loop_count().await, 1);

        let owned = ctx.store.loops().require(&record.id).unwrap();
        assert_eq!(owned.owner_kind, Some(OwnerKind::Daemon));

        assert!(ctx.stop_loop_runner(&record.id).await);
        wait_until_stopped(&ctx, &record.id).await;

        let stopped = ctx.store.loops().require(&record.id).unwrap();
        assert_eq!(stopped.state, LoopState::Stopped);
        assert!(stopped.owner_instance_id.is_none());
        assert_eq!(ctx.owned_loop_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_unowned_is_noop() {
        let (ctx, _temp) = context();
        assert!(!ctx.stop_loop_runner("not-ours").await);
    }

    #[tokio::test]
    async fn test_start_conflicts_with_live_owner() {
        let (ctx, _temp) = context();
        let record = ctx.store.loops().create("busy", LoopConfig::shell("./agent")).unwrap();
        ctx.store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "local-1", now_ms(), 60_000)
            .unwrap();

        let err = ctx.start_loop_runner(&record.id).await.unwrap_err();
        assert!(matches!(err, LoopdError::OwnershipConflict { .. }));
        assert_eq!(ctx.owned_loop_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_loops() {
        let (ctx, _temp) = context();
        let record = ctx.store.loops().create("s", LoopConfig::shell("./agent")).unwrap();
        ctx.start_loop_runner(&record.id).await.unwrap();

        ctx.shutdown_runners(Duration::from_secs(5)).await;
        let record = ctx.store.loops().require(&record.id).unwrap();
        assert_eq!(record.state, LoopState::Stopped);
        assert!(record.owner_instance_id.is_none());
    }
}
