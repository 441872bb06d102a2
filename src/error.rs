//! Error types for loopd
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in loopd
#[derive(Debug, Error)]
pub enum LoopdError {
    /// No pending item to dequeue. Callers run the default command instead.
    #[error("Queue empty for loop: {0}")]
    QueueEmpty(String),

    /// Queue item id does not exist
    #[error("Queue item not found: {0}")]
    QueueItemNotFound(String),

    /// Loop not found in storage
    #[error("Loop not found: {0}")]
    LoopNotFound(String),

    /// Compare-and-swap on the owner fields lost the race
    #[error("Ownership conflict on loop {loop_id}: owned by {owner}")]
    OwnershipConflict { loop_id: String, owner: String },

    /// The runner no longer holds ownership of its loop
    #[error("Ownership lost on loop {0}")]
    OwnershipLost(String),

    /// The external command could not be started
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// Malformed request or queue payload
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Daemon could not be reached
    #[error("Daemon unreachable: {0}")]
    Unreachable(String),

    /// Generic lookup miss (agents)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IPC communication error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoopdError {
    /// Races that callers absorb with retry or fallback instead of surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoopdError::OwnershipConflict { .. } | LoopdError::QueueEmpty(_))
    }
}

impl From<rusqlite::Error> for LoopdError {
    fn from(err: rusqlite::Error) -> Self {
        LoopdError::Storage(err.to_string())
    }
}

/// Result type alias for loopd operations
pub type Result<T> = std::result::Result<T, LoopdError>;
