//! Domain types for loopd
//!
//! This module contains all core domain types:
//! - LoopRecord: identity, configuration, runtime state and ownership of a loop
//! - QueueItem: typed directives consumed by a loop in position order
//! - IterationResult: append-only history of executed commands
//! - StopRule / CommandResult / Decision: inputs and output of the rule engine

pub mod iteration;
pub mod loop_record;
pub mod queue_item;
pub mod stop_rule;

pub use iteration::IterationResult;
pub use loop_record::{LoopConfig, LoopRecord, LoopState, OwnerKind};
pub use queue_item::{Condition, QueueItem, QueueItemStatus, QueueItemType, QueuePayload};
pub use stop_rule::{CommandResult, Decision, OutputMode, StopReason, StopRule, TIMED_OUT_EXIT_CODE};
