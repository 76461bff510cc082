//! Errors raised while reading or mutating host state.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single applier check or mutation.
///
/// These never abort a reconciliation pass; they are embedded in the
/// per-resource result and retried on the next pass.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The program could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited unsuccessfully.
    #[error("{command} exited with {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("{0} not found in PATH")]
    ToolMissing(String),

    #[error("no supported package manager found (apt, dnf, yum)")]
    NoPackageManager,

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid file mode {0:?}")]
    InvalidMode(String),

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    /// File is absent and there is no content to create it from.
    #[error("{} does not exist and no content was given", .0.display())]
    MissingFile(PathBuf),

    #[error("sha256 for {} does not match its content", .0.display())]
    DigestMismatch(PathBuf),

    /// Output of a read command could not be interpreted.
    #[error("unexpected output from {command}: {output}")]
    Unexpected { command: String, output: String },
}

impl ApplyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ApplyError::Io {
            path: path.into(),
            source,
        }
    }
}
