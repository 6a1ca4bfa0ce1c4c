use thiserror::Error;

use handoff_fabric::FabricError;

use crate::checkpoint::CheckpointError;

/// Failures surfaced by the agent's migration machinery.
#[derive(Debug, Error)]
pub enum AgentError {
    /// PID not registered here, or not present on the host at all.
    #[error("process {0} is not registered on this host")]
    UnknownProcess(i32),

    /// A migration clock already exists for this PID.
    #[error("process {0} is already migrating")]
    AlreadyMigrating(i32),

    /// A shadow frame arrived for a PID with no active migration.
    #[error("no active migration for process {0}")]
    UnknownMigration(i32),

    /// Bridge, address pool, or namespace failure.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// A POST to the peer agent failed.
    #[error("peer transport failure: {0}")]
    TransportFailure(String),

    /// Packing or unpacking the checkpoint archive failed.
    #[error("checkpoint archive failure: {0}")]
    ArchiveFailure(String),

    /// The dump engine reported failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl AgentError {
    pub(crate) fn archive(err: impl std::fmt::Display) -> Self {
        Self::ArchiveFailure(err.to_string())
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::TransportFailure(err.to_string())
    }
}
