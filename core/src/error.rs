use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Failures the supervisor reports synchronously at its call boundary.
///
/// Anything that happens after a process has been spawned (runtime errors,
/// nonzero exits, broken subscriber pipes) is absorbed into the run's log
/// stream or resolved by detaching the affected subscriber, never raised
/// through this type.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("run id `{id}` is already active")]
    DuplicateRun { id: String },

    #[error("unknown run id `{id}`")]
    NotFound { id: String },

    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn duplicate_run(id: impl Into<String>) -> Self {
        Self::DuplicateRun { id: id.into() }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub(crate) fn spawn_failure(command: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnFailure {
            command: command.into(),
            source,
        }
    }

    pub(crate) fn signal(pid: u32, source: io::Error) -> Self {
        Self::Signal { pid, source }
    }
}
