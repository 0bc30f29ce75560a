//! Error types for dml operations.
//! Every stage-local failure is wrapped with the module name and the stage it happened in,
//! so a message read from a log is enough to diagnose without re-deriving context.

use std::fmt;
use std::path::PathBuf;

use crate::events::EventKind;

/// Error returned by observers and code loaders supplied by the host.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = DmlError> = std::result::Result<T, E>;

/// Pipeline stage in which an error surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Lock,
    Download,
    Extract,
    Install,
    Load,
    Evict,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Lock => "lock",
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Install => "install",
            Stage::Load => "load",
            Stage::Evict => "evict",
        };
        f.write_str(s)
    }
}

/// Main error type for dml operations
#[derive(Debug, thiserror::Error)]
pub enum DmlError {
    #[error("Module name must not be empty")]
    InvalidModuleName { name: String },

    #[error(
        "Unable to obtain lock '{key}' within timeout period of {timeout_ms}ms. This is a recoverable \
         error that can be caused by a slow network or a stressed package server; try again or \
         increase the timeout. Underlying message: {message}"
    )]
    LockTimeout {
        key: String,
        timeout_ms: u64,
        message: String,
    },

    #[error("Lock error for '{key}': {message}")]
    Lock { key: String, message: String },

    #[error("Unable to download from {url}: {message}{}", status.map(|s| format!(" (status: {})", s)).unwrap_or_default())]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Unknown protocol in '{url}'. Expected one of file://, http://, https://")]
    UnknownProtocol { url: String },

    #[error("Unknown package file extension '{extension}'. Expected one of '.tar.gz', '.zip'")]
    UnknownPackageFormat { extension: String },

    #[error("Unable to extract {}: {message}", archive.display())]
    Extraction { archive: PathBuf, message: String },

    #[error("Unable to find package.json in directory {} or any of its sub directories", dir.display())]
    ManifestNotFound { dir: PathBuf },

    #[error(
        "Dependency installer does not exist at location '{}'. Make sure it is installed and the path is correctly set",
        path.display()
    )]
    InstallerMissing { path: PathBuf },

    #[error("{program} exited with {}", code.map(|c| format!("code {}", c)).unwrap_or_else(|| "no exit code (killed by signal)".to_string()))]
    InstallerExit { program: String, code: Option<i32> },

    #[error("Unable to load {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    #[error("Observer of {event} rejected continuation: {message}")]
    CheckpointRejected { event: EventKind, message: String },

    #[error("I/O error in {operation} ({}): {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module {module} failed during {stage}: {source}")]
    Stage {
        module: String,
        stage: Stage,
        #[source]
        source: Box<DmlError>,
    },
}

impl DmlError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DmlError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap with module and stage context. Already-wrapped errors are left alone.
    pub fn at(self, module: &str, stage: Stage) -> Self {
        match self {
            e @ DmlError::Stage { .. } => e,
            e => DmlError::Stage {
                module: module.to_string(),
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root_cause(&self) -> &DmlError {
        match self {
            DmlError::Stage { source, .. } => source.root_cause(),
            e => e,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            DmlError::Stage { stage, .. } => Some(*stage),
            DmlError::LockTimeout { .. } => Some(Stage::Lock),
            _ => None,
        }
    }

    /// HTTP status of a failed download, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self.root_cause() {
            DmlError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed without changing configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            DmlError::LockTimeout { .. }
                | DmlError::Lock { .. }
                | DmlError::Transport { .. }
                | DmlError::InstallerExit { .. }
                | DmlError::Io { .. }
        )
    }
}
