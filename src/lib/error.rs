use std::path::PathBuf;
use std::time::Duration;

/// The main error enum for this crate. Each variant is one class of failure a publish run can
/// hit; the stage it happened in is tracked separately by [`Failure`](crate::Failure).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Error {
    /// Output captured from a failed command, if this error came from one.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Error::Remote(remote) => remote.captured_output(),
            _ => None,
        }
    }
}

/// Missing or invalid configuration. Fatal for every run until fixed, so it is reported before a
/// run starts rather than as an [`Error`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

/// Problems with what the caller handed us.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read archive {}", path.display())]
    ReadArchive {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to store uploaded file '{name}'")]
    Store {
        name: String,
        #[source]
        err: std::io::Error,
    },
}

/// Local filesystem failures while preparing the working copy.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to remove {}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to create directory {}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to list directory {}", path.display())]
    List {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Cause of a failed version-control operation, as far as the underlying tool reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RemoteErrorKind {
    AuthFailure,
    BranchNotFound,
    NetworkFailure,
    Timeout,
    Other,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailure => write!(f, "authentication failure"),
            Self::BranchNotFound => write!(f, "branch not found"),
            Self::NetworkFailure => write!(f, "network failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Failures of clone/commit/push and the other version-control operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Command '{command}' exited with status {status} ({kind})")]
    Subprocess {
        kind: RemoteErrorKind,
        command: String,
        status: std::process::ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("Command '{command}' timed out after {}s", timeout.as_secs())]
    Timeout {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("failed to run '{command}'")]
    Launch {
        command: String,
        #[source]
        err: std::io::Error,
    },
    #[cfg(feature = "libgit2")]
    #[error("git {operation} failed ({kind}): {err}")]
    Library {
        kind: RemoteErrorKind,
        operation: &'static str,
        #[source]
        err: git2::Error,
    },
}

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            RemoteError::Subprocess { kind, .. } => *kind,
            RemoteError::Timeout { .. } => RemoteErrorKind::Timeout,
            RemoteError::Launch { .. } => RemoteErrorKind::Other,
            #[cfg(feature = "libgit2")]
            RemoteError::Library { kind, .. } => *kind,
        }
    }

    /// `(stdout, stderr)` of the failed command.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            RemoteError::Subprocess { stdout, stderr, .. }
            | RemoteError::Timeout { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// Archives that are corrupt or try to write where they shouldn't.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive is corrupt")]
    Corrupt(#[from] zip::result::ZipError),
    #[error("entry '{entry}' resolves outside the destination directory")]
    PathEscape { entry: String },
    #[error("entry '{entry}' is a symbolic link, links are not extracted")]
    SymlinkRejected { entry: String },
    #[error("entry '{entry}' would overwrite version-control metadata or a preserved entry")]
    ReservedPath { entry: String },
    #[error("entry name '{entry}' is not a valid relative path")]
    InvalidPath { entry: String },
    #[error("failed to read entry '{entry}' from the archive")]
    Read {
        entry: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}
