//! Error types for the upgrade protocol.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The successor process could not be created.
#[derive(Debug, Error)]
#[error("failed to spawn successor {}: {source}", .program.display())]
pub struct SpawnError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The descriptor table for the successor could not be prepared.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to duplicate listener '{name}': {source}")]
    Duplicate {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode descriptor table: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to set up readiness pipe: {0}")]
    ReadyPipe(#[source] io::Error),
}

/// The environment handed down by a predecessor is unusable.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("{var} is malformed: {reason}")]
    Malformed { var: &'static str, reason: String },

    #[error("HANDOFF_READY_FD must be set together with HANDOFF_LISTENERS")]
    MissingReadyFd,

    #[error("inherited descriptor {fd} for '{name}' is unusable: {source}")]
    Descriptor {
        name: String,
        fd: i32,
        #[source]
        source: io::Error,
    },
}

/// Reporting readiness failed.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("failed to notify predecessor: {0}")]
    Notify(#[source] io::Error),

    #[error("generation is already shutting down")]
    Stopping,
}

/// An upgrade attempt failed. The current generation keeps serving.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("an upgrade is already in progress")]
    InProgress,

    #[error("this generation has not reported ready yet")]
    NotReady,

    #[error("this generation is shutting down")]
    Stopping,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("successor did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("successor exited before becoming ready ({0})")]
    SuccessorExited(String),

    #[error("successor sent an unexpected readiness message")]
    BadReadyMessage,

    #[error("reading successor readiness failed: {0}")]
    ReadyPipe(#[source] io::Error),
}
