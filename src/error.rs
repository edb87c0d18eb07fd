use std::sync::Arc;
use uuid::Uuid;

use crate::command::Program;


#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run {program}: {source}")]
    SpawnFailed {
        program: Program,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{program} exited with code {code}")]
    ExitFailure { program: Program, code: i32 },

    #[error("{program} was terminated by a signal")]
    Terminated { program: Program },

    #[error("failed to read output of {program}: {source}")]
    OutputFailed {
        program: Program,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("unknown program: {0}")]
    UnknownProgram(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource is busy: {0}")]
    ResourceBusy(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task chain not found: {0}")]
    ChainNotFound(Uuid),

    #[error("task chain has no tasks")]
    EmptyChain,

    #[error("task has no steps")]
    NoSteps,

    #[error("task chain {chain} expects position {expected}, got {got}")]
    ChainPosition { chain: Uuid, expected: usize, got: usize },

    #[error("task already finished: {0}")]
    TaskFinished(Uuid),

    #[error("task cancelled")]
    Cancelled,

    #[error("scheduler is not running")]
    SchedulerClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resource discovery failed: {0}")]
    Discovery(String),

    #[error("inventory unavailable: {0}")]
    Inventory(String),
}

impl Error {
    /// Errors caused by the request itself rather than by the system.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Error::UnknownProgram(_)
                | Error::EmptyChain
                | Error::NoSteps
                | Error::ChainPosition { .. }
        )
    }
}
