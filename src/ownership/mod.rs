//! Ownership resolution - who drives a loop.
//!
//! A loop is driven either by the process that asked for it (`local`) or by
//! the daemon (`daemon`). Claims go through the store's compare-and-swap on
//! the owner fields so concurrent claimants resolve to one winner.

mod link;
mod resolver;

pub use link::{DaemonLink, IpcDaemonLink};
pub use resolver::{OwnershipResolver, Resolution, SpawnOwner};
