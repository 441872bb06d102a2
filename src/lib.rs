//! loopd - supervised command loops with handoff between processes
//!
//! A loop runs an external command over and over, consults its stop rules
//! after every iteration and consumes queued directives in order. A loop is
//! owned by exactly one process at a time, either the CLI that started it or
//! a long-running daemon, and owners that stop heartbeating are reclaimed.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod id;
pub mod ipc;
pub mod ownership;
pub mod recovery;
pub mod rules;
pub mod runner;
pub mod store;

pub use error::{LoopdError, Result};
