//! Stale-runner detection and reclaim.
//!
//! A loop whose owner stopped heartbeating for longer than the threshold is
//! presumed orphaned. The sweep clears its owner with a conditional update so
//! concurrent sweepers cannot both reclaim it, then either stops the loop or
//! hands it to a [`Restarter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::domain::{LoopRecord, LoopState, OwnerKind};
use crate::error::Result;
use crate::id::now_ms;
use crate::store::Store;

/// Stop reason written on reclaimed loops.
pub const RECLAIMED_REASON: &str = "previous owner presumed dead, reclaimed";

/// Configuration for stale detection.
#[derive(Debug, Clone)]
pub struct StaleConfig {
    /// Heartbeat age at which an owner is presumed dead.
    pub threshold: Duration,

    /// Time between sweeps.
    pub sweep_interval: Duration,

    /// Restart reclaimed loops whose config leaves `auto_restart` unset.
    pub auto_restart_default: bool,
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(45 * 60),
            sweep_interval: Duration::from_secs(60),
            auto_restart_default: false,
        }
    }
}

impl StaleConfig {
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_auto_restart_default(mut self, enabled: bool) -> Self {
        self.auto_restart_default = enabled;
        self
    }

    pub fn threshold_ms(&self) -> i64 {
        self.threshold.as_millis() as i64
    }
}

/// Starts a reclaimed loop under a new owner.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, loop_id: &str) -> Result<OwnerKind>;
}

/// Outcome for one stale loop found by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepResult {
    /// Owner cleared and loop stopped.
    Reclaimed { loop_id: String, previous_owner: String },

    /// Owner cleared and loop restarted under a new owner.
    Restarted {
        loop_id: String,
        previous_owner: String,
        owner: OwnerKind,
    },

    /// Reclaimed, but the restart failed; the loop was stopped.
    RestartFailed { loop_id: String, error: String },

    /// Someone else reclaimed it or the owner heartbeated in between.
    Raced { loop_id: String },
}

impl SweepResult {
    pub fn loop_id(&self) -> &str {
        match self {
            SweepResult::Reclaimed { loop_id, .. }
            | SweepResult::Restarted { loop_id, .. }
            | SweepResult::RestartFailed { loop_id, .. }
            | SweepResult::Raced { loop_id } => loop_id,
        }
    }
}

/// Counters over one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub reclaimed: usize,
    pub restarted: usize,
    pub restart_failed: usize,
    pub raced: usize,
}

impl SweepStats {
    pub fn from_results(scanned: usize, results: &[SweepResult]) -> Self {
        let mut stats = Self {
            scanned,
            ..Default::default()
        };
        for result in results {
            match result {
                SweepResult::Reclaimed { .. } => stats.reclaimed += 1,
                SweepResult::Restarted { .. } => stats.restarted += 1,
                SweepResult::RestartFailed { .. } => stats.restart_failed += 1,
                SweepResult::Raced { .. } => stats.raced += 1,
            }
        }
        stats
    }
}

/// Judges staleness purely on heartbeat age.
pub fn is_stale(record: &LoopRecord, now: i64, threshold_ms: i64) -> bool {
    record.state.is_active() && record.heartbeat_age_ms(now).is_none_or(|age| age >= threshold_ms)
}

/// Periodic sweeper over active loops.
pub struct StaleRunnerDetector {
    store: Arc<Store>,
    config: StaleConfig,
    restarter: Option<Arc<dyn Restarter>>,
}

impl StaleRunnerDetector {
    pub fn new(store: Arc<Store>, config: StaleConfig) -> Self {
        Self {
            store,
            config,
            restarter: None,
        }
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    pub fn config(&self) -> &StaleConfig {
        &self.config
    }

    /// Sweep once using the current time.
    pub async fn sweep(&self) -> Result<Vec<SweepResult>> {
        self.sweep_at(now_ms()).await
    }

    /// Sweep once as if the clock read `now`.
    pub async fn sweep_at(&self, now: i64) -> Result<Vec<SweepResult>> {
        let threshold_ms = self.config.threshold_ms();
        let active = self.store.loops().list_active()?;
        let scanned = active.len();

        let mut results = Vec::new();
        for record in active {
            if !is_stale(&record, now, threshold_ms) {
                continue;
            }
            match self.reclaim(&record, now, threshold_ms).await {
                Ok(result) => results.push(result),
                Err(e) => error!("Reclaim of {} failed, continuing sweep: {}", record.id, e),
            }
        }

        let stats = SweepStats::from_results(scanned, &results);
        if !results.is_empty() {
            info!(
                "Stale sweep: {} scanned, {} reclaimed, {} restarted, {} restart failures, {} raced",
                stats.scanned, stats.reclaimed, stats.restarted, stats.restart_failed, stats.raced
            );
        } else {
            debug!("Stale sweep: {} active loops, none stale", scanned);
        }
        Ok(results)
    }

    async fn reclaim(&self, record: &LoopRecord, now: i64, threshold_ms: i64) -> Result<SweepResult> {
        let loop_id = record.id.clone();
        let previous_owner = record.owner_label();
        let restarter = self
            .restarter
            .as_ref()
            .filter(|_| record.config.auto_restart.unwrap_or(self.config.auto_restart_default));
        let new_state = if restarter.is_some() {
            LoopState::Idle
        } else {
            LoopState::Stopped
        };

        // Heartbeat must be strictly older than now - threshold + 1, i.e. age >= threshold
        let stale_before = now - threshold_ms + 1;
        let won = self.store.loops().reclaim_stale(
            &loop_id,
            record.owner_instance_id.as_deref(),
            stale_before,
            new_state,
            RECLAIMED_REASON,
            now,
        )?;
        if !won {
            debug!("Reclaim of {} raced, leaving it", loop_id);
            return Ok(SweepResult::Raced { loop_id });
        }
        warn!("Loop {} ({}) reclaimed from {}", record.name, loop_id, previous_owner);

        let Some(restarter) = restarter else {
            return Ok(SweepResult::Reclaimed {
                loop_id,
                previous_owner,
            });
        };

        match restarter.restart(&loop_id).await {
            Ok(owner) => {
                info!("Loop {} restarted under {}", loop_id, owner);
                Ok(SweepResult::Restarted {
                    loop_id,
                    previous_owner,
                    owner,
                })
            }
            Err(e) => {
                error!("Restart of {} failed: {}", loop_id, e);
                let now = now_ms();
                self.store.loops().stop_unowned(&loop_id, RECLAIMED_REASON, now)?;
                self.store.loops().note_error(&loop_id, &format!("restart failed: {e}"), now)?;
                Ok(SweepResult::RestartFailed {
                    loop_id,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Stale sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Stale detector shutting down");
                        break;
                    }
                }
            }
        }
    }
}
