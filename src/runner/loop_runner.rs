//! Loop runner - drives one owned loop until a stop decision.
//!
//! Each pass through the loop:
//! 1. Checks runtime limits and stop requests
//! 2. Handles the head of the queue (stop, pause, conditional, scale, message)
//! 3. Runs the command, with any injected input, under its timeout
//! 4. Evaluates the stop rules
//! 5. Persists the iteration result and heartbeat in one write
//!
//! All writes are guarded by the runner's instance id. If another process
//! takes the loop over, the next write fails with `OwnershipLost` and the
//! runner exits without touching the record again.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::command::{CommandExecutor, CommandSpec};
use crate::domain::{
    CommandResult, Condition, Decision, IterationResult, LoopConfig, LoopState, QueueItem, QueueItemStatus,
    QueuePayload,
};
use crate::error::{LoopdError, Result};
use crate::id::now_ms;
use crate::rules::{MatcherResults, evaluate_with};
use crate::store::Store;

/// Timeout for conditional predicate commands.
const CONDITION_TIMEOUT: Duration = Duration::from_secs(60);

const STOP_REQUESTED: &str = "stop requested";
const STOP_ITEM: &str = "stop item";

/// Configuration for the LoopRunner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often to refresh the heartbeat while blocked
    pub heartbeat_interval: Duration,
    /// How often to re-check pause and conditional items
    pub poll_interval: Duration,
    /// Bytes of stdout/stderr kept per iteration
    pub output_tail_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            output_tail_bytes: 4096,
        }
    }
}

/// How a runner finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunnerOutcome {
    /// Stop rule, stop item, stop request or runtime limit
    Stopped { reason: String },
    /// Launch failure or unrecoverable error
    Failed { error: String },
}

impl RunnerOutcome {
    pub fn final_state(&self) -> LoopState {
        match self {
            RunnerOutcome::Stopped { .. } => LoopState::Stopped,
            RunnerOutcome::Failed { .. } => LoopState::Failed,
        }
    }
}

impl std::fmt::Display for RunnerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerOutcome::Stopped { reason } => write!(f, "stopped ({reason})"),
            RunnerOutcome::Failed { error } => write!(f, "failed ({error})"),
        }
    }
}

/// Progress notifications from a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    StateChanged {
        loop_id: String,
        state: LoopState,
    },
    IterationCompleted {
        loop_id: String,
        sequence: u32,
        exit_code: i32,
        decision: Decision,
    },
}

/// Handle for asking a running loop to stop.
///
/// The request is graceful: an in-flight command finishes first.
#[derive(Debug, Clone)]
pub struct RunnerControl {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl Default for RunnerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerControl {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

/// Result of waiting on a pause or conditional item.
enum Wait {
    Proceed,
    StopRequested(String),
}

/// LoopRunner executes a single owned loop.
pub struct LoopRunner<E: CommandExecutor + ?Sized> {
    store: Arc<Store>,
    executor: Arc<E>,
    loop_id: String,
    loop_config: LoopConfig,
    instance_id: String,
    config: RunnerConfig,
    control: RunnerControl,
    events: Option<broadcast::Sender<RunnerEvent>>,
    state: LoopState,
    /// Last persisted sequence number
    sequence: u32,
    /// Iterations executed by this runner
    iterations_run: u32,
    last_beat: Instant,
}

impl<E: CommandExecutor + ?Sized> LoopRunner<E> {
    /// Create a runner for a loop already claimed by `instance_id`.
    pub fn new(
        store: Arc<Store>,
        executor: Arc<E>,
        loop_id: &str,
        instance_id: &str,
        config: RunnerConfig,
    ) -> Result<Self> {
        let record = store.loops().require(loop_id)?;
        if !record.is_owned_by(instance_id) {
            return Err(LoopdError::OwnershipLost(loop_id.to_string()));
        }

        Ok(Self {
            store,
            executor,
            loop_id: record.id,
            loop_config: record.config,
            instance_id: instance_id.to_string(),
            config,
            control: RunnerControl::new(),
            events: None,
            state: record.state,
            sequence: record.iteration_count,
            iterations_run: 0,
            last_beat: Instant::now(),
        })
    }

    /// Publish state changes and iteration results on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<RunnerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn control(&self) -> RunnerControl {
        self.control.clone()
    }

    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    /// Run until stopped. Ownership is released on every exit except
    /// `OwnershipLost`, where another owner already holds the record.
    pub async fn run(mut self) -> Result<RunnerOutcome> {
        self.store
            .loops()
            .mark_running(&self.loop_id, &self.instance_id, now_ms())?;
        self.last_beat = Instant::now();
        self.state = LoopState::Running;
        self.emit_state();
        info!("Loop {} running under {}", self.loop_id, self.instance_id);

        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(LoopdError::OwnershipLost(id)) => {
                warn!("Loop {} lost ownership; runner exiting", id);
                return Err(LoopdError::OwnershipLost(id));
            }
            Err(e) => {
                error!("Loop {} failed: {}", self.loop_id, e);
                RunnerOutcome::Failed { error: e.to_string() }
            }
        };

        self.finish(&outcome)?;
        Ok(outcome)
    }

    async fn drive(&mut self) -> Result<RunnerOutcome> {
        let started = Instant::now();

        loop {
            if self.loop_config.max_iterations > 0 && self.iterations_run >= self.loop_config.max_iterations {
                return Ok(RunnerOutcome::Stopped {
                    reason: "max_iterations reached".into(),
                });
            }
            if self.loop_config.max_runtime_secs > 0
                && started.elapsed() >= Duration::from_secs(self.loop_config.max_runtime_secs)
            {
                return Ok(RunnerOutcome::Stopped {
                    reason: "max_runtime reached".into(),
                });
            }
            if self.control.is_stop_requested() {
                return self.stop_now(STOP_REQUESTED);
            }

            let head = match self.store.queue().peek(&self.loop_id) {
                Ok(item) => Some(item),
                Err(LoopdError::QueueEmpty(_)) => None,
                Err(e) => return Err(e),
            };

            let (input, item_id) = match head.map(|item| item.payload) {
                None => (None, None),
                Some(QueuePayload::Stop { reason }) => {
                    let item = self.store.queue().dequeue(&self.loop_id)?;
                    self.transition(LoopState::Stopping)?;
                    self.settle(&item.id, QueueItemStatus::Completed, None)?;
                    let reason = reason.unwrap_or_else(|| STOP_ITEM.to_string());
                    return Ok(RunnerOutcome::Stopped { reason });
                }
                Some(QueuePayload::Pause { duration_secs, reason }) => {
                    let item = self.store.queue().dequeue(&self.loop_id)?;
                    debug!("Loop {} pausing: {}", self.loop_id, reason.as_deref().unwrap_or("no reason"));
                    if let Wait::StopRequested(reason) = self.pause(&item, duration_secs).await? {
                        return self.stop_now(&reason);
                    }
                    continue;
                }
                Some(QueuePayload::Conditional { condition, message, .. }) => {
                    let item = self.store.queue().dequeue(&self.loop_id)?;
                    if let Wait::StopRequested(reason) = self.await_condition(&item, &condition).await? {
                        return self.stop_now(&reason);
                    }
                    match message {
                        Some(text) => (Some(text), Some(item.id)),
                        None => continue,
                    }
                }
                Some(QueuePayload::Scale { replicas }) => {
                    let item = self.store.queue().dequeue(&self.loop_id)?;
                    self.store
                        .loops()
                        .set_replicas(&self.loop_id, &self.instance_id, replicas, now_ms())?;
                    self.loop_config.replicas = replicas;
                    self.last_beat = Instant::now();
                    self.settle(&item.id, QueueItemStatus::Completed, None)?;
                    info!("Loop {} scaled to {} replicas", self.loop_id, replicas);
                    continue;
                }
                Some(QueuePayload::Message { text }) => {
                    let item = self.store.queue().dequeue(&self.loop_id)?;
                    (Some(text), Some(item.id))
                }
            };

            let (decision, launch_error) = self.run_iteration(input, item_id).await?;
            match decision {
                Decision::Continue => {}
                Decision::Stop { rule, reason } => {
                    if let Some(error) = launch_error {
                        return Ok(RunnerOutcome::Failed {
                            error: format!("launch failed: {error}"),
                        });
                    }
                    return Ok(RunnerOutcome::Stopped {
                        reason: format!("{rule}: {reason}"),
                    });
                }
            }

            if self.loop_config.interval_secs > 0
                && let Wait::StopRequested(reason) = self
                    .sleep_for(Duration::from_secs(self.loop_config.interval_secs))
                    .await?
            {
                return self.stop_now(&reason);
            }
        }
    }

    /// Run the command once, evaluate it and persist the result.
    async fn run_iteration(
        &mut self,
        input: Option<String>,
        item_id: Option<String>,
    ) -> Result<(Decision, Option<String>)> {
        let sequence = self.sequence + 1;
        let spec = self.iteration_spec(sequence, input);

        let started_at = now_ms();
        let result = self.execute_with_heartbeat(&spec).await?;
        let matcher_results = self.run_matchers(&result).await?;
        let decision = evaluate_with(&self.loop_config.stop_rules, &result, &matcher_results);
        let finished_at = now_ms();

        let iteration = IterationResult::from_command(
            &self.loop_id,
            sequence,
            started_at,
            finished_at,
            &result,
            decision.clone(),
            self.config.output_tail_bytes,
        )
        .with_queue_item(item_id.clone());

        self.store
            .loops()
            .record_iteration(&self.instance_id, &iteration, finished_at)?;
        self.sequence = sequence;
        self.iterations_run += 1;
        self.last_beat = Instant::now();

        if let Some(item_id) = item_id {
            match &result.launch_error {
                Some(error) => self.settle(&item_id, QueueItemStatus::Failed, Some(error))?,
                None => self.settle(&item_id, QueueItemStatus::Completed, None)?,
            }
        }

        debug!(
            "Loop {} iteration {} exit {} -> {}",
            self.loop_id, sequence, result.exit_code, decision
        );
        self.emit(RunnerEvent::IterationCompleted {
            loop_id: self.loop_id.clone(),
            sequence,
            exit_code: result.exit_code,
            decision: decision.clone(),
        });

        Ok((decision, result.launch_error))
    }

    fn iteration_spec(&self, sequence: u32, input: Option<String>) -> CommandSpec {
        let mut spec = CommandSpec::for_loop(&self.loop_config)
            .env("LOOPD_LOOP_ID", &self.loop_id)
            .env("LOOPD_ITERATION", sequence.to_string())
            .stdin(input);
        if let Some(profile) = &self.loop_config.profile {
            spec = spec.env("LOOPD_PROFILE", profile);
        }
        if let Some(prompt) = &self.loop_config.prompt {
            spec = spec.env("LOOPD_PROMPT", prompt);
        }
        spec
    }

    /// Run matcher commands of rules that carry one.
    async fn run_matchers(&mut self, result: &CommandResult) -> Result<MatcherResults> {
        let mut results = MatcherResults::new();
        if result.is_launch_failure() {
            return Ok(results);
        }

        let matchers: Vec<(usize, CommandSpec)> = self
            .loop_config
            .stop_rules
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| {
                let cmd = rule.cmd.as_ref()?;
                let timeout = Duration::from_secs(rule.timeout_secs.unwrap_or(self.loop_config.timeout_secs));
                let spec = CommandSpec::shell(cmd.clone(), timeout)
                    .working_dir(self.loop_config.working_dir.clone())
                    .env("LOOPD_LOOP_ID", &self.loop_id);
                Some((index, spec))
            })
            .collect();

        for (index, spec) in matchers {
            let matched = self.execute_with_heartbeat(&spec).await?;
            results.insert(index, matched);
        }
        Ok(results)
    }

    /// Await a command while keeping the heartbeat fresh. A stop request
    /// arriving meanwhile moves the loop to `stopping` but never interrupts
    /// the command.
    async fn execute_with_heartbeat(&mut self, spec: &CommandSpec) -> Result<CommandResult> {
        let executor = Arc::clone(&self.executor);
        let command = executor.execute(spec);
        tokio::pin!(command);

        let mut stop_rx = self.control.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut command => return Ok(result),
                _ = ticker.tick() => self.heartbeat()?,
                changed = stop_rx.changed(), if self.state != LoopState::Stopping => {
                    if changed.is_ok() && *stop_rx.borrow() {
                        self.transition(LoopState::Stopping)?;
                    }
                }
            }
        }
    }

    async fn pause(&mut self, item: &QueueItem, duration_secs: Option<u64>) -> Result<Wait> {
        let deadline = duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.transition(LoopState::Paused)?;

        loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.settle(&item.id, QueueItemStatus::Completed, None)?;
                break;
            }
            if !self.still_dispatched(&item.id)? {
                break;
            }
            let wait = match self.take_queued_stop()? {
                Some(reason) => Wait::StopRequested(reason),
                None => self.idle_tick().await?,
            };
            if let Wait::StopRequested(reason) = wait {
                self.settle(&item.id, QueueItemStatus::Failed, Some("loop stopped while paused"))?;
                return Ok(Wait::StopRequested(reason));
            }
        }

        info!("Loop {} resumed", self.loop_id);
        self.transition(LoopState::Running)?;
        Ok(Wait::Proceed)
    }

    async fn await_condition(&mut self, item: &QueueItem, condition: &Condition) -> Result<Wait> {
        loop {
            let satisfied = match condition {
                Condition::Manual => !self.still_dispatched(&item.id)?,
                Condition::NotBefore { at_ms } => now_ms() >= *at_ms,
                Condition::Command { cmd } => {
                    let spec = CommandSpec::shell(cmd.clone(), CONDITION_TIMEOUT)
                        .working_dir(self.loop_config.working_dir.clone());
                    let result = self.execute_with_heartbeat(&spec).await?;
                    result.exit_code == 0 && !result.timed_out && !result.is_launch_failure()
                }
            };
            if satisfied {
                self.settle(&item.id, QueueItemStatus::Completed, None)?;
                return Ok(Wait::Proceed);
            }
            let wait = match self.take_queued_stop()? {
                Some(reason) => Wait::StopRequested(reason),
                None => self.idle_tick().await?,
            };
            if let Wait::StopRequested(reason) = wait {
                self.settle(&item.id, QueueItemStatus::Failed, Some("loop stopped while waiting"))?;
                return Ok(Wait::StopRequested(reason));
            }
        }
    }

    async fn sleep_for(&mut self, duration: Duration) -> Result<Wait> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if let wait @ Wait::StopRequested(_) = self.idle_tick().await? {
                return Ok(wait);
            }
        }
        Ok(Wait::Proceed)
    }

    /// Sleep one poll interval (cut short by a stop request), heartbeating
    /// when due.
    async fn idle_tick(&mut self) -> Result<Wait> {
        if self.control.is_stop_requested() {
            return Ok(Wait::StopRequested(STOP_REQUESTED.to_string()));
        }
        let mut stop_rx = self.control.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = stop_rx.changed() => {}
        }
        if self.last_beat.elapsed() >= self.config.heartbeat_interval {
            self.heartbeat()?;
        }
        if self.control.is_stop_requested() {
            return Ok(Wait::StopRequested(STOP_REQUESTED.to_string()));
        }
        Ok(Wait::Proceed)
    }

    /// Honor a `stop` item queued behind the item the runner is blocked on.
    fn take_queued_stop(&mut self) -> Result<Option<String>> {
        let Some(item) = self.store.queue().take_stop(&self.loop_id)? else {
            return Ok(None);
        };
        self.transition(LoopState::Stopping)?;
        self.settle(&item.id, QueueItemStatus::Completed, None)?;
        let reason = match item.payload {
            QueuePayload::Stop { reason: Some(reason) } => reason,
            _ => STOP_ITEM.to_string(),
        };
        info!("Loop {} stopping on queued stop while blocked", self.loop_id);
        Ok(Some(reason))
    }

    fn still_dispatched(&self, item_id: &str) -> Result<bool> {
        Ok(self
            .store
            .queue()
            .get(item_id)?
            .is_some_and(|item| item.status == QueueItemStatus::Dispatched))
    }

    /// Record an item's outcome unless an operator already settled or removed it.
    fn settle(&self, item_id: &str, status: QueueItemStatus, error: Option<&str>) -> Result<()> {
        match self.store.queue().update_status(item_id, status, error) {
            Ok(()) | Err(LoopdError::InvalidState(_)) | Err(LoopdError::QueueItemNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stop_now(&mut self, reason: &str) -> Result<RunnerOutcome> {
        if self.state != LoopState::Stopping {
            self.transition(LoopState::Stopping)?;
        }
        Ok(RunnerOutcome::Stopped {
            reason: reason.to_string(),
        })
    }

    fn heartbeat(&mut self) -> Result<()> {
        self.store
            .loops()
            .heartbeat(&self.loop_id, &self.instance_id, now_ms())?;
        self.last_beat = Instant::now();
        Ok(())
    }

    fn transition(&mut self, state: LoopState) -> Result<()> {
        self.store
            .loops()
            .set_state(&self.loop_id, &self.instance_id, state, now_ms())?;
        self.state = state;
        self.last_beat = Instant::now();
        self.emit_state();
        Ok(())
    }

    fn finish(&mut self, outcome: &RunnerOutcome) -> Result<()> {
        let state = outcome.final_state();
        let (reason, error) = match outcome {
            RunnerOutcome::Stopped { reason } => (Some(reason.as_str()), None),
            RunnerOutcome::Failed { error } => (None, Some(error.as_str())),
        };
        self.store
            .loops()
            .release_owner(&self.loop_id, &self.instance_id, state, reason, error, now_ms())?;
        self.state = state;
        self.emit_state();
        info!("Loop {} {}", self.loop_id, outcome);
        Ok(())
    }

    fn emit_state(&self) {
        self.emit(RunnerEvent::StateChanged {
            loop_id: self.loop_id.clone(),
            state: self.state,
        });
    }

    fn emit(&self, event: RunnerEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine
            let _ = events.send(event);
        }
    }
}
