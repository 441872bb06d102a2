//! Stop rules, command results and the decisions made from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LoopdError, Result};

/// Exit code reserved for "the process timed out".
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

/// Rule name reported when the iteration command could not be started.
pub const LAUNCH_FAILED_RULE: &str = "launch_failed";

/// How a rule inspects one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// No constraint on this stream
    #[default]
    Any,
    /// Trimmed output is zero-length
    Empty,
    /// Trimmed output is non-zero-length
    Nonempty,
    /// Output matches the rule's regex
    Regex,
}

/// Declarative predicate over a completed command.
///
/// A rule matches when every configured predicate holds: exit code, stdout
/// mode and stderr mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRule {
    /// Reported name; defaults to `rule-{n}` (1-based position)
    pub name: Option<String>,
    /// Matcher command. When set, the rule is evaluated against this
    /// command's result instead of the iteration's.
    pub cmd: Option<String>,
    /// Accepted exit codes; empty accepts any. `-1` also accepts timeouts.
    pub exit_codes: Vec<i32>,
    pub stdout_mode: OutputMode,
    pub stdout_regex: Option<String>,
    pub stderr_mode: OutputMode,
    pub stderr_regex: Option<String>,
    /// Timeout for the matcher command
    pub timeout_secs: Option<u64>,
}

impl StopRule {
    /// Name used in decisions for the rule at `index` (0-based).
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("rule-{}", index + 1),
        }
    }

    /// Reject rules that can never be evaluated.
    pub fn validate(&self) -> Result<()> {
        check_stream("stdout", self.stdout_mode, self.stdout_regex.as_deref())?;
        check_stream("stderr", self.stderr_mode, self.stderr_regex.as_deref())?;
        if let Some(cmd) = &self.cmd
            && cmd.trim().is_empty()
        {
            return Err(LoopdError::InvalidArgument("stop rule cmd is empty".into()));
        }
        Ok(())
    }
}

fn check_stream(stream: &str, mode: OutputMode, pattern: Option<&str>) -> Result<()> {
    if mode != OutputMode::Regex {
        return Ok(());
    }
    let pattern = pattern
        .ok_or_else(|| LoopdError::InvalidArgument(format!("{stream}_mode regex requires {stream}_regex")))?;
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| LoopdError::InvalidArgument(format!("invalid {stream}_regex {pattern:?}: {e}")))
}

/// Outcome of running an external command once.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Process exit code; `-1` when timed out or killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the process could not be started at all
    pub launch_error: Option<String>,
}

impl CommandResult {
    /// A process that ran to completion.
    pub fn completed(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
            launch_error: None,
        }
    }

    /// A process killed after exceeding its timeout.
    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: TIMED_OUT_EXIT_CODE,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: true,
            launch_error: None,
        }
    }

    /// A process that never started.
    pub fn launch_failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: TIMED_OUT_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            launch_error: Some(error.into()),
        }
    }

    pub fn is_launch_failure(&self) -> bool {
        self.launch_error.is_some()
    }
}

/// Why a loop was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A configured rule matched
    Matched,
    /// The command could not be started
    LaunchFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Matched => write!(f, "matched"),
            StopReason::LaunchFailed => write!(f, "launch_failed"),
        }
    }
}

/// Rule engine verdict for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Stop { rule: String, reason: StopReason },
}

impl Decision {
    pub fn stop(rule: impl Into<String>, reason: StopReason) -> Self {
        Decision::Stop {
            rule: rule.into(),
            reason,
        }
    }

    pub fn launch_failed() -> Self {
        Self::stop(LAUNCH_FAILED_RULE, StopReason::LaunchFailed)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Decision::Stop { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Continue => write!(f, "continue"),
            Decision::Stop { rule, reason } => write!(f, "stop ({rule}: {reason})"),
        }
    }
}
