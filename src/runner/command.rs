//! External command execution.
//!
//! The loop's command, stop-rule matcher commands and conditional predicates
//! all run through a [`CommandExecutor`], so the runner can be driven by a
//! scripted executor in tests.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::domain::{CommandResult, LoopConfig};

/// How long to wait for output pipes after a timed-out process was killed.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Exit code when the status could not be observed at all.
const UNKNOWN_EXIT_CODE: i32 = 255;

/// Shell convention: a process killed by signal N exits 128 + N. `-1` stays
/// reserved for timeouts.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => UNKNOWN_EXIT_CODE,
    }
}

/// One command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program, or a shell line when `args` is empty
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Text written to the process's stdin
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    /// A shell line run under `sh -c`
    pub fn shell(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    /// The loop's configured command with its directory, env and timeout.
    pub fn for_loop(config: &LoopConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            stdin: None,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: Option<String>) -> Self {
        self.stdin = input;
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = if self.args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        } else {
            let mut cmd = Command::new(&self.command);
            cmd.args(&self.args);
            cmd
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Runs commands to completion and reports a [`CommandResult`].
///
/// Implementations never fail: launch errors and timeouts are encoded in the
/// result so the rule engine can judge them.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> CommandResult;
}

/// Executes commands as child processes.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, spec: &CommandSpec) -> CommandResult {
        let mut child = match spec.to_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch {:?}: {}", spec.command, e);
                return CommandResult::launch_failed(e.to_string());
            }
        };

        if let (Some(input), Some(mut sink)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = sink.write_all(input.as_bytes()).await {
                    debug!("stdin write failed: {}", e);
                }
            });
        }

        let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_to_string(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_to_string(pipe)));

        match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => CommandResult::completed(
                exit_code(status),
                collect(stdout).await,
                collect(stderr).await,
            ),
            Ok(Err(e)) => CommandResult {
                exit_code: UNKNOWN_EXIT_CODE,
                stdout: collect(stdout).await,
                stderr: format!("wait failed: {e}"),
                timed_out: false,
                launch_error: None,
            },
            Err(_) => {
                debug!("Command {:?} timed out after {:?}", spec.command, spec.timeout);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out command: {}", e);
                }
                CommandResult::timed_out(collect(stdout).await, collect(stderr).await)
            }
        }
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("output read failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_GRACE, handle).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}
