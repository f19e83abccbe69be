use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::TaskIdentifier;

#[derive(Debug, Error)]
pub enum TaskguardError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Error while extracting sandbox violations:\n{0}")]
    Sandbox(#[from] SandboxError),

    #[error("Task '{0}' not found")]
    TaskNotFound(TaskIdentifier),

    #[error("Invalid progress bar template.\n{0}")]
    ProgressTemplate(#[from] indicatif::style::TemplateError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate task identifier '{0}'")]
    DuplicateIdentifier(TaskIdentifier),

    #[error("Attempted to intern a value into a frozen arena")]
    Frozen,

    #[error("Interning arena ran out of handles")]
    ArenaCapacity,

    #[error("Couldn't encode the task store.\n{0}")]
    Encode(#[from] ciborium::ser::Error<io::Error>),

    #[error("Couldn't decode the task store.\n{0}")]
    Decode(#[from] ciborium::de::Error<io::Error>),
}

/// The underlying process could not be launched or awaited.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Task has an empty command line")]
    EmptyCommandLine,

    #[error("Couldn't launch '{program}'.\n{source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't wait for '{program}'.\n{source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Trace file missing, unreadable or malformed after a successful exit.
///
/// These point at broken instrumentation rather than at a dependency
/// declaration problem, so they are kept apart from verification failures.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Couldn't read trace file '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't remove stale trace file '{path}'.\n{source}")]
    Remove {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't append to outer trace file '{path}'.\n{source}")]
    Append {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't decode trace file '{path}'.\n{source}")]
    Decode {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("Verification failed to run.\n{0}")]
    Verify(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox log queries must not run on an async runtime worker thread")]
    InsideRuntime,

    #[error("Couldn't query the system log.\n{0}")]
    Query(#[from] anyhow::Error),

    #[error("Sandbox log query thread terminated unexpectedly")]
    Thread,
}
