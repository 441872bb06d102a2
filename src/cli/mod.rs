//! CLI module for loopd - command-line interface and subcommands.
//!
//! The CLI is a thin shell over the library: it opens the store, resolves
//! ownership and either drives a loop in the foreground or talks to the
//! daemon over its socket.

pub mod commands;
mod handlers;

pub use commands::Cli;
pub use handlers::run;
