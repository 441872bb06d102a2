//! Recovery from owners that died without releasing their loops.
//!
//! Owners prove liveness by heartbeating. The stale detector sweeps active
//! loops, reclaims those whose heartbeat expired and optionally restarts them.

mod stale;

pub use stale::{RECLAIMED_REASON, Restarter, StaleConfig, StaleRunnerDetector, SweepResult, SweepStats, is_stale};
