//! Runner lifecycle - executes an owned loop iteration by iteration.
//!
//! - [`CommandExecutor`] runs the loop's command and matcher commands
//! - [`LoopRunner`] drives the queue, the rule engine and the store
//! - [`RunnerControl`] requests a graceful stop from another task

mod command;
mod loop_runner;

pub use command::{CommandExecutor, CommandSpec, ShellExecutor};
pub use loop_runner::{LoopRunner, RunnerConfig, RunnerControl, RunnerEvent, RunnerOutcome};
