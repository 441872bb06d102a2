//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - daemon: serve the control plane in the foreground
//! - up / run: create and drive loops
//! - ps / status: inspect loops
//! - queue: manage a loop's queue
//! - resume / stop / rm / sweep: lifecycle
//! - ping / send / agents: talk to the daemon

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::daemon::SpecialKey;
use crate::domain::{LoopState, QueueItemType};
use crate::ownership::SpawnOwner;

/// loopd - run commands in supervised loops
#[derive(Parser, Debug)]
#[command(name = "loopd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Socket path override
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Create a loop and start it
    Up {
        /// Unique loop name
        name: String,

        /// Loop definition (YAML)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Working directory for the command
        #[arg(short = 'C', long)]
        workdir: Option<PathBuf>,

        /// Per-iteration timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Stop after this many iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Stop after this many seconds of runtime
        #[arg(long)]
        max_runtime: Option<u64>,

        /// Seconds to sleep between iterations
        #[arg(long)]
        interval: Option<u64>,

        /// Stop when the command exits with one of these codes
        #[arg(long = "stop-on-exit")]
        stop_on_exit: Vec<i32>,

        /// Stop when stdout matches this regex
        #[arg(long = "stop-on-stdout")]
        stop_on_stdout: Option<String>,

        /// Restart after the owner is presumed dead
        #[arg(long)]
        auto_restart: bool,

        /// Who drives the loop: local, daemon or auto
        #[arg(long)]
        owner: Option<SpawnOwner>,

        /// Only create the loop
        #[arg(long)]
        no_start: bool,

        /// Command to run each iteration
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Start (or take over) an existing loop
    Run {
        /// Loop name, id or short id
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// Who drives the loop: local, daemon or auto
        #[arg(long)]
        owner: Option<SpawnOwner>,
    },

    /// List loops
    Ps {
        /// Only loops in this state
        #[arg(short, long)]
        state: Option<LoopState>,
    },

    /// Show a loop with its recent iterations
    Status {
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// Number of iterations to show
        #[arg(short = 'n', long, default_value_t = 5)]
        iterations: usize,
    },

    /// Manage a loop's queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Release a paused or waiting loop
    Resume {
        #[arg(value_name = "LOOP")]
        loop_ref: String,
    },

    /// Stop a loop gracefully
    Stop {
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// Reason recorded on the loop
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Delete a loop with its queue and history
    Rm {
        #[arg(value_name = "LOOP")]
        loop_ref: String,
    },

    /// Reclaim loops whose owner stopped heartbeating
    Sweep {
        /// Hand auto-restart loops to the daemon
        #[arg(long)]
        restart: bool,
    },

    /// Check that the daemon answers
    Ping,

    /// Send input to a daemon-managed agent
    Send {
        agent_id: String,

        /// Text to send after the keys
        text: Option<String>,

        /// Special key to send first (repeatable)
        #[arg(short, long = "key")]
        keys: Vec<SpecialKey>,
    },

    /// List daemon agents, or show one
    Agents {
        agent_id: Option<String>,

        /// Only agents in this state (repeatable)
        #[arg(short, long = "state")]
        states: Vec<LoopState>,

        /// Only agents in this workspace
        #[arg(short, long)]
        workspace: Option<String>,
    },
}

/// Queue subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum QueueCommands {
    /// Append an item
    Add {
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// message, pause, conditional, scale or stop
        #[arg(value_name = "TYPE")]
        item_type: QueueItemType,

        /// Message text (message, conditional)
        #[arg(short, long)]
        text: Option<String>,

        /// Pause duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Reason (pause, stop)
        #[arg(long)]
        reason: Option<String>,

        /// Human-readable predicate (conditional)
        #[arg(long)]
        predicate: Option<String>,

        /// Proceed once this shell command exits 0 (conditional)
        #[arg(long)]
        when_cmd: Option<String>,

        /// Proceed at or after this unix time in ms (conditional)
        #[arg(long)]
        not_before: Option<i64>,

        /// Replica count (scale)
        #[arg(long)]
        replicas: Option<u32>,
    },

    /// List items
    Ls {
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// Include finished items
        #[arg(short, long)]
        all: bool,
    },

    /// Remove one item
    Rm { item_id: String },

    /// Remove all pending items
    Clear {
        #[arg(value_name = "LOOP")]
        loop_ref: String,
    },

    /// Reorder pending items
    Reorder {
        #[arg(value_name = "LOOP")]
        loop_ref: String,

        /// Every pending item id in the new order
        #[arg(required = true)]
        item_ids: Vec<String>,
    },
}
