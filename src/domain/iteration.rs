//! Iteration results - append-only history of executed commands.

use serde::{Deserialize, Serialize};

use crate::domain::stop_rule::{CommandResult, Decision};

/// One completed run of the external command inside a loop iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub loop_id: String,
    /// 1-based, per loop
    pub sequence: u32,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub decision: Decision,
    /// Queue item whose input was injected, if any
    pub queue_item_id: Option<String>,
    /// Launch error text when the process could not start
    pub error: Option<String>,
}

impl IterationResult {
    /// Build a result from a finished command, keeping the last `tail_bytes`
    /// of each output stream.
    pub fn from_command(
        loop_id: &str,
        sequence: u32,
        started_at: i64,
        finished_at: i64,
        result: &CommandResult,
        decision: Decision,
        tail_bytes: usize,
    ) -> Self {
        Self {
            loop_id: loop_id.to_string(),
            sequence,
            started_at,
            finished_at,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            stdout_tail: tail(&result.stdout, tail_bytes),
            stderr_tail: tail(&result.stderr, tail_bytes),
            decision,
            queue_item_id: None,
            error: result.launch_error.clone(),
        }
    }

    pub fn with_queue_item(mut self, item_id: Option<String>) -> Self {
        self.queue_item_id = item_id;
        self
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at - self.started_at
    }
}

/// Last `max_bytes` of `text`, cut forward to a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
