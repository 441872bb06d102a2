//! IPC Layer - Unix socket transport for the daemon's control plane
//!
//! This module provides:
//! - Message types for requests, responses and events
//! - Unix socket server for the daemon
//! - Client used by the CLI and the ownership resolver

pub mod client;
pub mod messages;
pub mod server;

pub use client::{IpcClient, IpcClientConfig};
pub use messages::{DaemonError, DaemonEvent, DaemonRequest, DaemonResponse, ErrorCode, Events, Methods};
pub use server::{IpcServer, IpcServerConfig, RequestHandler};
